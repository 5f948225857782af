//! Static charts of recorded sessions. This runs after (and entirely
//! independently of) a recording session, and only ever reads the CSV files
//! that sessions produce.

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use plotters::coord::Shift;
use plotters::prelude::*;
use plotters::style::FontStyle;

use crate::csv::tokenise_line;
use crate::error::{Error, Result};
use crate::schema::{Schema, IMU, SCALE, TIMESTAMP_COLUMN};

const FONT_FAMILY: &str = "sans-serif";

// ab_glyph needs to be handed a font explicitly, so we go looking for one of
// the usual suspects.
const SYSTEM_FONTS: [&str; 8] = [
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
    "/usr/share/fonts/liberation/LiberationSans-Regular.ttf",
    "/System/Library/Fonts/Supplemental/Arial.ttf",
    "/Library/Fonts/Arial.ttf",
    "C:\\Windows\\Fonts\\arial.ttf",
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlotConfig {
    /// TrueType font for titles and labels. System fonts are tried if this
    /// is unset or unusable. Fonts are registered once per process, so only
    /// the first plot's choice takes effect.
    pub font: Option<PathBuf>,
    /// Image width in pixels. The height follows from the number of panels.
    pub width: u32,
}

impl Default for PlotConfig {
    fn default() -> PlotConfig {
        PlotConfig {
            font: None,
            width: 1800,
        }
    }
}

/// Returns the most recently created `<schema>_data_*.csv` in `dir`.
pub fn find_latest_data_file(dir: &Path, schema: &Schema) -> Result<PathBuf> {
    let prefix = schema.data_file_prefix();
    let mut latest: Option<(std::time::SystemTime, PathBuf)> = None;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !name.starts_with(&prefix) || !name.ends_with(".csv") {
            continue;
        }
        let metadata = entry.metadata()?;
        if !metadata.is_file() {
            continue;
        }
        // Not every filesystem records creation times.
        let created = metadata.created().or_else(|_| metadata.modified())?;
        let path = entry.path();
        let is_newer = match &latest {
            None => true,
            Some((time, latest_path)) => (created, &path) > (*time, latest_path),
        };
        if is_newer {
            latest = Some((created, path));
        }
    }
    latest
        .map(|(_, path)| path)
        .ok_or(Error::NoDataFiles(schema.name))
}

/// A loaded data file: the header, plus all rows as raw text.
#[derive(Debug)]
pub struct DataTable {
    path: PathBuf,
    columns: Vec<String>,
    rows: Vec<Row>,
}

#[derive(Debug)]
struct Row {
    /// 1-based line number in the source file.
    line: usize,
    cells: Vec<String>,
}

impl DataTable {
    pub fn load(path: &Path) -> Result<DataTable> {
        let reader = std::io::BufReader::new(std::fs::File::open(path)?);
        let mut columns: Option<Vec<String>> = None;
        let mut rows = Vec::new();
        for (i, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let cells = tokenise_line(&line).map_err(|e| Error::Csv {
                path: path.to_path_buf(),
                line: i + 1,
                message: e.message(),
            })?;
            match columns.as_ref().map(Vec::len) {
                None => columns = Some(cells),
                Some(width) if width != cells.len() => {
                    return Err(Error::Csv {
                        path: path.to_path_buf(),
                        line: i + 1,
                        message: "row length does not match header",
                    });
                }
                Some(_) => rows.push(Row { line: i + 1, cells }),
            }
        }
        Ok(DataTable {
            path: path.to_path_buf(),
            columns: columns.unwrap_or_default(),
            rows,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    fn column_index(&self, name: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|column| column == name)
            .ok_or_else(|| Error::MissingColumn {
                path: self.path.clone(),
                column: name.to_string(),
            })
    }

    /// Parses every cell in the named column as a number.
    pub fn column(&self, name: &str) -> Result<Vec<f64>> {
        let index = self.column_index(name)?;
        self.rows
            .iter()
            .map(|row| {
                let cell = row.cells[index].trim();
                cell.parse::<f64>().map_err(|_| Error::InvalidValue {
                    path: self.path.clone(),
                    line: row.line,
                    column: name.to_string(),
                    value: cell.to_string(),
                })
            })
            .collect()
    }

    /// The raw text of the named column in the final row.
    pub fn last_value(&self, name: &str) -> Result<&str> {
        let index = self.column_index(name)?;
        self.rows
            .last()
            .map(|row| row.cells[index].trim())
            .ok_or_else(|| Error::EmptyTable {
                path: self.path.clone(),
            })
    }
}

struct SeriesSpec {
    column: &'static str,
    label: &'static str,
    color: RGBColor,
}

struct PanelSpec {
    title: &'static str,
    y_desc: &'static str,
    series: Vec<SeriesSpec>,
}

struct Layout {
    title: &'static str,
    panels: Vec<PanelSpec>,
}

fn xyz(prefix: &'static [&'static str; 3]) -> Vec<SeriesSpec> {
    [("X", RED), ("Y", GREEN), ("Z", BLUE)]
        .into_iter()
        .zip(prefix.iter())
        .map(|((label, color), column)| SeriesSpec {
            column: *column,
            label,
            color,
        })
        .collect()
}

fn layout(schema: &Schema) -> Layout {
    if *schema == IMU {
        Layout {
            title: "IMU Sensor Data",
            panels: vec![
                PanelSpec {
                    title: "Accelerometer Data",
                    y_desc: "Acceleration (g)",
                    series: xyz(&["accelX", "accelY", "accelZ"]),
                },
                PanelSpec {
                    title: "Gyroscope Data",
                    y_desc: "Angular Velocity (deg/s)",
                    series: xyz(&["gyroX", "gyroY", "gyroZ"]),
                },
            ],
        }
    } else if *schema == SCALE {
        Layout {
            title: "Scale Weight Measurements",
            panels: vec![PanelSpec {
                title: "Weight vs Time",
                y_desc: "Weight (g)",
                series: vec![SeriesSpec {
                    column: "weight_g",
                    label: "Weight",
                    color: BLUE,
                }],
            }],
        }
    } else {
        // Everything but the timestamp, on a single panel.
        let palette = [RED, GREEN, BLUE, MAGENTA, CYAN, BLACK];
        Layout {
            title: schema.name,
            panels: vec![PanelSpec {
                title: schema.name,
                y_desc: "Value",
                series: schema
                    .header
                    .iter()
                    .filter(|column| **column != TIMESTAMP_COLUMN)
                    .zip(palette.iter().cycle())
                    .map(|(column, color)| SeriesSpec {
                        column: *column,
                        label: *column,
                        color: *color,
                    })
                    .collect(),
            }],
        }
    }
}

struct FontState {
    requested: Option<PathBuf>,
    available: bool,
}

/// Registers a font with plotters, at most once per process. Returns whether
/// text can be drawn.
fn ensure_font(config: &PlotConfig) -> bool {
    static FONT: OnceLock<FontState> = OnceLock::new();
    let state = FONT.get_or_init(|| FontState {
        requested: config.font.clone(),
        available: register_any_font(config),
    });
    if state.requested != config.font {
        log::warn!(
            "Font {:?} ignored, fonts can only be chosen once per process",
            config.font
        );
    }
    state.available
}

fn register_any_font(config: &PlotConfig) -> bool {
    let candidates = config
        .font
        .iter()
        .cloned()
        .chain(SYSTEM_FONTS.iter().map(PathBuf::from));
    for candidate in candidates {
        let Ok(bytes) = std::fs::read(&candidate) else {
            continue;
        };
        // plotters keeps the font for the lifetime of the process.
        let bytes: &'static [u8] = Box::leak(bytes.into_boxed_slice());
        if plotters::style::register_font(FONT_FAMILY, FontStyle::Normal, bytes).is_ok() {
            log::debug!("Using font {}", candidate.display());
            return true;
        }
        log::warn!("Unusable font {}", candidate.display());
    }
    log::warn!("No usable font found, plots will be drawn without text");
    false
}

fn render_error<E: std::fmt::Display>(e: E) -> Error {
    Error::Render(e.to_string())
}

fn value_range<'a>(values: impl Iterator<Item = &'a f64>) -> std::ops::Range<f64> {
    let (min, max) = values
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(min, max), v| {
            (min.min(*v), max.max(*v))
        });
    if min > max {
        return 0.0..1.0;
    }
    let pad = if max > min { (max - min) * 0.05 } else { 0.5 };
    (min - pad)..(max + pad)
}

struct Panel<'a> {
    spec: &'a PanelSpec,
    values: Vec<Vec<f64>>,
}

fn draw_panel<DB: DrawingBackend>(
    area: &DrawingArea<DB, Shift>,
    time: &[f64],
    panel: &Panel,
    with_text: bool,
) -> Result<()> {
    let x_range = value_range(time.iter());
    let y_range = value_range(panel.values.iter().flatten());

    let mut builder = ChartBuilder::on(area);
    builder.margin(20).x_label_area_size(60).y_label_area_size(80);
    if with_text {
        builder.caption(panel.spec.title, (FONT_FAMILY, 32));
    }
    let mut chart = builder
        .build_cartesian_2d(x_range, y_range)
        .map_err(render_error)?;

    {
        let mut mesh = chart.configure_mesh();
        if with_text {
            mesh.x_desc("Time (seconds)")
                .y_desc(panel.spec.y_desc)
                .label_style((FONT_FAMILY, 20));
        } else {
            mesh.x_labels(0).y_labels(0);
        }
        mesh.draw().map_err(render_error)?;
    }

    for (series, values) in panel.spec.series.iter().zip(&panel.values) {
        let color = series.color;
        let points = time.iter().copied().zip(values.iter().copied());
        let drawn = chart
            .draw_series(LineSeries::new(points, color.stroke_width(2)))
            .map_err(render_error)?;
        if with_text {
            drawn
                .label(series.label)
                .legend(move |(x, y)| {
                    PathElement::new(vec![(x, y), (x + 20, y)], color.stroke_width(2))
                });
        }
    }

    if with_text {
        chart
            .configure_series_labels()
            .label_font((FONT_FAMILY, 20))
            .background_style(WHITE.mix(0.8))
            .border_style(BLACK)
            .draw()
            .map_err(render_error)?;
    }
    Ok(())
}

/// Renders `table` as a PNG at `out`. Time is plotted in seconds.
pub fn render(table: &DataTable, schema: &Schema, out: &Path, config: &PlotConfig) -> Result<()> {
    if table.row_count() == 0 {
        return Err(Error::EmptyTable {
            path: table.path().to_path_buf(),
        });
    }
    let layout = layout(schema);
    let time: Vec<f64> = table
        .column(TIMESTAMP_COLUMN)?
        .into_iter()
        .map(|ms| ms / 1000.0)
        .collect();
    // Load everything before creating the image, so that bad data can't leave
    // a half-drawn file behind.
    let panels = layout
        .panels
        .iter()
        .map(|spec| {
            Ok(Panel {
                spec,
                values: spec
                    .series
                    .iter()
                    .map(|series| table.column(series.column))
                    .collect::<Result<_>>()?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let with_text = ensure_font(config);
    let panel_height = config.width / 3;
    let size = (config.width, panel_height * panels.len() as u32 + 100);

    let root = BitMapBackend::new(out, size).into_drawing_area();
    root.fill(&WHITE).map_err(render_error)?;
    let body = if with_text {
        root.titled(layout.title, (FONT_FAMILY, 40))
            .map_err(render_error)?
    } else {
        root.margin(40, 0, 0, 0)
    };
    let areas = body.split_evenly((panels.len(), 1));
    for (area, panel) in areas.iter().zip(&panels) {
        draw_panel(area, &time, panel, with_text)?;
    }
    root.present().map_err(render_error)?;
    Ok(())
}

/// `<schema>_plot_<last timestamp>.png`, next to the data file.
pub fn plot_path(table: &DataTable, schema: &Schema) -> Result<PathBuf> {
    let name = schema.plot_file_name(table.last_value(TIMESTAMP_COLUMN)?);
    Ok(match table.path().parent() {
        Some(dir) => dir.join(name),
        None => PathBuf::from(name),
    })
}

/// Loads and renders one data file, returning the path of the image.
pub fn plot_file(data: &Path, schema: &Schema, config: &PlotConfig) -> Result<PathBuf> {
    log::info!("Loading data from: {}", data.display());
    let table = DataTable::load(data)?;
    let out = plot_path(&table, schema)?;
    render(&table, schema, &out, config)?;
    log::info!("Plot saved as: {}", out.display());
    Ok(out)
}

/// Plots the newest data file for `schema` in `dir`.
pub fn plot_latest(dir: &Path, schema: &Schema, config: &PlotConfig) -> Result<PathBuf> {
    let data = find_latest_data_file(dir, schema)?;
    plot_file(&data, schema, config)
}

/// Hands the image to the platform's default viewer. We don't wait for the
/// viewer to exit.
pub fn open_in_viewer(path: &Path) -> Result<()> {
    let mut command = if cfg!(target_os = "windows") {
        let mut command = std::process::Command::new("cmd");
        command.args(["/C", "start", ""]);
        command
    } else if cfg!(target_os = "macos") {
        std::process::Command::new("open")
    } else {
        std::process::Command::new("xdg-open")
    };
    command.arg(path).spawn()?;
    Ok(())
}
