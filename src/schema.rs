use std::str::FromStr;

use crate::error::Error;

/// Describes one kind of sensor stream: what the device sends per line, and
/// how the resulting files are named.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Schema {
    /// Prefix used for data and plot file names, e.g. "imu".
    pub name: &'static str,
    pub header: &'static [&'static str],
}

pub const TIMESTAMP_COLUMN: &str = "timestamp(ms)";

pub const IMU: Schema = Schema {
    name: "imu",
    header: &[
        TIMESTAMP_COLUMN,
        "accelX",
        "accelY",
        "accelZ",
        "gyroX",
        "gyroY",
        "gyroZ",
    ],
};

pub const SCALE: Schema = Schema {
    name: "scale",
    header: &[TIMESTAMP_COLUMN, "weight_g"],
};

pub const ALL_SCHEMAS: [Schema; 2] = [IMU, SCALE];

impl Schema {
    /// The exact number of fields a line must contain to be recorded.
    pub fn arity(&self) -> usize {
        self.header.len()
    }

    /// `<name>_data_<YYYYMMDD_HHMMSS>.csv`
    pub fn data_file_name(&self, date_time: time::OffsetDateTime) -> String {
        let format = time::macros::format_description!(
            version = 2,
            "[year][month][day]_[hour][minute][second]"
        );
        // The format only contains fields that OffsetDateTime always has, so
        // this can only fail on a broken `time` install.
        let stamp = date_time
            .format(&format)
            .unwrap_or_else(|_| date_time.unix_timestamp().to_string());
        format!("{}_data_{stamp}.csv", self.name)
    }

    pub fn data_file_prefix(&self) -> String {
        format!("{}_data_", self.name)
    }

    /// `<name>_plot_<timestamp>.png`, where timestamp is the raw value of the
    /// last row's timestamp column.
    pub fn plot_file_name(&self, last_timestamp: &str) -> String {
        format!("{}_plot_{last_timestamp}.png", self.name)
    }
}

impl FromStr for Schema {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALL_SCHEMAS
            .iter()
            .find(|schema| schema.name.eq_ignore_ascii_case(s))
            .copied()
            .ok_or_else(|| Error::UnknownSchema(s.to_string()))
    }
}

impl std::fmt::Display for Schema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name)
    }
}
