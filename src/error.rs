use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unable to open serial port {port}: {source}")]
    Connect {
        port: String,
        #[source]
        source: serialport::Error,
    },

    #[error("serial port enumeration failed: {0}")]
    Enumerate(#[from] serialport::Error),

    #[error("no serial port selected")]
    NoPortSelected,

    #[error("unknown schema '{0}' (expected 'imu' or 'scale')")]
    UnknownSchema(String),

    #[error("output file {0} already exists")]
    OutputExists(PathBuf),

    #[error("no {0} data files found")]
    NoDataFiles(&'static str),

    #[error("{path} contains no data rows")]
    EmptyTable { path: PathBuf },

    #[error("{path}: missing column '{column}'")]
    MissingColumn { path: PathBuf, column: String },

    #[error("{path}:{line}: invalid value '{value}' in column '{column}'")]
    InvalidValue {
        path: PathBuf,
        line: usize,
        column: String,
        value: String,
    },

    #[error("{path}:{line}: {message}")]
    Csv {
        path: PathBuf,
        line: usize,
        message: &'static str,
    },

    #[error("unable to install interrupt handler: {0}")]
    InterruptHandler(#[from] ctrlc::Error),

    #[error("rendering failed: {0}")]
    Render(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
