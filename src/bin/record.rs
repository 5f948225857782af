use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;

use sensorlog::plot::{self, PlotConfig};
use sensorlog::session::{self, ProgressEcho};
use sensorlog::{
    FixedPort, PortResolver, PromptResolver, RecordConfig, Schema, SerialConfig, StopFlag,
    Termination,
};

/// Records sensor readings from a serial device into a timestamped CSV file.
#[derive(Parser, Debug)]
#[command(version)]
struct Args {
    /// Which sensor is attached: imu or scale.
    schema: Schema,

    /// Serial port to use. The device is auto-detected (or you will be asked)
    /// if omitted.
    #[arg(short, long)]
    port: Option<String>,

    /// Directory to write the data file to.
    #[arg(short, long, default_value = ".")]
    output_dir: PathBuf,

    #[arg(long, default_value_t = 9600)]
    baud: u32,

    /// Read timeout. Ctrl+C is noticed within this interval.
    #[arg(long, default_value_t = 1000)]
    timeout_ms: u64,

    /// Plot the data once recording has stopped, and open the plot in the
    /// default image viewer.
    #[arg(long)]
    plot: bool,

    /// Only save the plot, don't open it.
    #[arg(long, requires = "plot")]
    no_show: bool,
}

/// Plots a finished recording. Failing to plot doesn't undo the recording,
/// so problems are reported here rather than passed on.
fn plot_recording(data: &Path, schema: &Schema, show: bool) -> Option<PathBuf> {
    let image = match plot::plot_file(data, schema, &PlotConfig::default()) {
        Ok(image) => image,
        Err(e) => {
            eprintln!("Error creating plot: {e}");
            return None;
        }
    };
    eprintln!("Plot saved as: {}", image.display());
    if show {
        if let Err(e) = plot::open_in_viewer(&image) {
            eprintln!("Error opening plot: {e}");
        }
    }
    Some(image)
}

fn run(args: Args) -> sensorlog::Result<()> {
    // The port is resolved before installing the interrupt handler, so that
    // Ctrl+C still aborts the process while it's waiting for the operator.
    let port = match args.port {
        Some(port) => port,
        None => PromptResolver::from_system()?.resolve()?,
    };

    let config = RecordConfig {
        serial: SerialConfig::default()
            .baud_rate(args.baud)
            .timeout(Duration::from_millis(args.timeout_ms)),
        output_dir: args.output_dir,
        utc_offset: session::local_offset(),
    };

    let stop = StopFlag::new();
    stop.install_interrupt_handler()?;

    eprintln!("Press Ctrl+C to stop recording");
    let mut progress = ProgressEcho::new(std::io::stderr());
    let summary = sensorlog::record(
        &mut FixedPort(port),
        args.schema,
        &config,
        stop,
        &mut progress,
    )?;

    if summary.termination == Termination::EndOfStream {
        log::warn!("Device on {} went away", summary.port_name);
    }
    eprintln!(
        "Recorded {} rows to {} ({} lines dropped)",
        summary.stats.accepted,
        summary.output.display(),
        summary.stats.dropped()
    );

    if args.plot {
        plot_recording(&summary.output, &args.schema, !args.no_show);
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    eprintln!("Sensor recorder (v{})", env!("CARGO_PKG_VERSION"));

    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
