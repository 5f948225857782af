use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use sensorlog::plot::{self, PlotConfig};
use sensorlog::Schema;

/// Plots a recorded data file. By default this picks the most recent file
/// for the given sensor in the current directory.
#[derive(Parser, Debug)]
#[command(version)]
struct Args {
    /// Which sensor the data came from: imu or scale.
    schema: Schema,

    /// Directory to search for data files.
    #[arg(short, long, default_value = ".", conflicts_with = "file")]
    dir: PathBuf,

    /// Plot this file instead of the most recent one.
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// TrueType font for titles and labels.
    #[arg(long)]
    font: Option<PathBuf>,

    /// Image width in pixels.
    #[arg(long, default_value_t = 1800)]
    width: u32,

    /// Only save the plot, don't open it in the default image viewer.
    #[arg(long)]
    no_show: bool,
}

fn run(args: Args) -> sensorlog::Result<()> {
    let config = PlotConfig {
        font: args.font,
        width: args.width,
    };
    let image = match &args.file {
        Some(file) => plot::plot_file(file, &args.schema, &config)?,
        None => plot::plot_latest(&args.dir, &args.schema, &config)?,
    };
    eprintln!("Plot saved as: {}", image.display());
    if !args.no_show {
        plot::open_in_viewer(&image)?;
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
