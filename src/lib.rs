extern crate serialport;

pub mod csv;
mod error;
pub mod plot;
pub mod port;
pub mod protocol;
pub mod schema;
pub mod session;

pub use error::{Error, Result};
pub use port::{FixedPort, PortResolver, PromptResolver};
pub use schema::Schema;
pub use session::{
    record, RecordConfig, SerialConfig, Session, SessionStats, SessionSummary, StopFlag,
    Termination,
};
