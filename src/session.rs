use std::fs::OpenOptions;
use std::io::{BufRead, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::csv::RecordWriter;
use crate::error::{Error, Result};
use crate::port::PortResolver;
use crate::protocol::{self, Discard, Record};
use crate::schema::Schema;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SerialConfig {
    pub baud_rate: u32,
    /// How long a single read may block. This also bounds how long it takes
    /// for an interrupt to be noticed.
    pub timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> SerialConfig {
        SerialConfig {
            baud_rate: 9600,
            timeout: Duration::from_secs(1),
        }
    }
}

impl SerialConfig {
    pub fn baud_rate(mut self, baud_rate: u32) -> SerialConfig {
        self.baud_rate = baud_rate;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> SerialConfig {
        self.timeout = timeout;
        self
    }
}

/// An open connection to the device. The port is closed when the handle is
/// dropped, which happens exactly once whichever way the session ends.
pub struct DeviceHandle {
    port_name: String,
    reader: std::io::BufReader<Box<dyn serialport::SerialPort>>,
}

impl DeviceHandle {
    pub fn open(port_name: &str, config: &SerialConfig) -> Result<DeviceHandle> {
        let port = serialport::new(port_name, config.baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .timeout(config.timeout)
            .open()
            .map_err(|source| Error::Connect {
                port: port_name.to_string(),
                source,
            })?;
        log::info!("Connected to {port_name} at {} baud", config.baud_rate);
        Ok(DeviceHandle {
            port_name: port_name.to_string(),
            reader: std::io::BufReader::new(port),
        })
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }
}

impl Read for DeviceHandle {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reader.read(buf)
    }
}

impl BufRead for DeviceHandle {
    fn fill_buf(&mut self) -> std::io::Result<&[u8]> {
        self.reader.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.reader.consume(amt)
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        log::info!("Serial connection to {} closed", self.port_name);
    }
}

/// Shared "please stop" signal. It is set from the interrupt handler's thread
/// and polled by the session after every read.
#[derive(Clone, Debug, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> StopFlag {
        StopFlag::default()
    }

    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Routes Ctrl-C (SIGINT/SIGTERM where supported) to this flag. This can
    /// only be done once per process.
    pub fn install_interrupt_handler(&self) -> Result<()> {
        let flag = self.clone();
        ctrlc::set_handler(move || flag.request_stop())?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Termination {
    /// The operator asked us to stop. This is the normal way for a session to
    /// end.
    StoppedByUser,
    /// The port stopped producing data altogether (e.g. the device vanished).
    EndOfStream,
}

impl Termination {
    pub fn describe(&self) -> &'static str {
        match self {
            Termination::StoppedByUser => "Recording stopped by user",
            Termination::EndOfStream => "Device stopped sending data",
        }
    }
}

/// Per-session counters. None of these affect what ends up in the file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub accepted: usize,
    pub wrong_arity: usize,
    pub invalid_utf8: usize,
    pub empty: usize,
    pub timeouts: usize,
}

impl SessionStats {
    pub fn dropped(&self) -> usize {
        self.wrong_arity + self.invalid_utf8
    }
}

/// The ingestion loop: reads lines from `source`, and appends every line that
/// matches `schema` to `writer`. The session owns the source for its entire
/// lifetime, and releases it when `run` returns.
pub struct Session<S: BufRead, W: Write> {
    source: S,
    writer: RecordWriter<W>,
    schema: Schema,
    stop: StopFlag,
    stats: SessionStats,
}

impl<S: BufRead, W: Write> Session<S, W> {
    /// Writes the header to `output` straight away.
    pub fn new(source: S, output: W, schema: Schema, stop: StopFlag) -> Result<Session<S, W>> {
        let writer = RecordWriter::new(output, &schema)?;
        Ok(Session {
            source,
            writer,
            schema,
            stop,
            stats: SessionStats::default(),
        })
    }

    /// Runs until the stop flag is raised, the source ends, or reading/writing
    /// fails. `on_record` is called after each record has been written.
    pub fn run(mut self, mut on_record: impl FnMut(&Record)) -> Result<(Termination, SessionStats)> {
        // Bytes are accumulated across timeouts: the device may well be
        // halfway through a line when the read gives up.
        let mut buf = Vec::with_capacity(128);
        // Devices tend to greet us with some kind of banner (or half a line
        // that was in flight when we connected). The first complete line is
        // therefore never data.
        let mut preamble_pending = true;

        let termination = loop {
            if self.stop.is_stopped() {
                break Termination::StoppedByUser;
            }
            let end_of_stream = match self.source.read_until(b'\n', &mut buf) {
                Ok(0) => true,
                Ok(_) => false,
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
                    ) =>
                {
                    self.stats.timeouts += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            // An interrupt that arrived while we were blocked takes priority
            // over whatever line we ended up with.
            if self.stop.is_stopped() {
                break Termination::StoppedByUser;
            }
            if !buf.is_empty() {
                if preamble_pending {
                    preamble_pending = false;
                    log::debug!("Discarding preamble: {:?}", String::from_utf8_lossy(&buf));
                } else {
                    self.process_line(&buf, &mut on_record)?;
                }
                buf.clear();
            }
            if end_of_stream {
                break Termination::EndOfStream;
            }
        };
        Ok((termination, self.stats))
    }

    fn process_line(&mut self, raw: &[u8], on_record: &mut impl FnMut(&Record)) -> Result<()> {
        match protocol::parse_raw_line(raw, self.schema.arity()) {
            Ok(record) => {
                self.writer.write_record(&record)?;
                self.stats.accepted += 1;
                on_record(&record);
            }
            Err(Discard::Empty) => self.stats.empty += 1,
            Err(Discard::InvalidUtf8) => {
                self.stats.invalid_utf8 += 1;
                log::debug!("Dropping undecodable line: {raw:?}");
            }
            Err(Discard::WrongArity { expected, actual }) => {
                self.stats.wrong_arity += 1;
                log::debug!(
                    "Dropping line with {actual} fields (expected {expected}): {:?}",
                    String::from_utf8_lossy(raw).trim()
                );
            }
        }
        Ok(())
    }
}

/// The local UTC offset, for naming files in local time. The `time` crate
/// refuses to determine this once a process has multiple threads on some
/// platforms (and installing the interrupt handler spawns one), so this needs
/// to be called early. Falls back to UTC.
pub fn local_offset() -> time::UtcOffset {
    time::UtcOffset::current_local_offset().unwrap_or_else(|_| {
        log::warn!("Local UTC offset unavailable, file names will use UTC");
        time::UtcOffset::UTC
    })
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordConfig {
    pub serial: SerialConfig,
    pub output_dir: PathBuf,
    /// Offset used for the timestamp in the output file name.
    pub utc_offset: time::UtcOffset,
}

impl Default for RecordConfig {
    fn default() -> RecordConfig {
        RecordConfig {
            serial: SerialConfig::default(),
            output_dir: PathBuf::from("."),
            utc_offset: time::UtcOffset::UTC,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionSummary {
    pub port_name: String,
    pub output: PathBuf,
    pub termination: Termination,
    pub stats: SessionStats,
}

/// Creates `<dir>/<schema>_data_<timestamp>.csv`, refusing to touch an
/// existing file.
pub fn create_output_file(
    dir: &Path,
    schema: &Schema,
    date_time: time::OffsetDateTime,
) -> Result<(PathBuf, std::fs::File)> {
    let path = dir.join(schema.data_file_name(date_time));
    match OpenOptions::new().write(true).create_new(true).open(&path) {
        Ok(file) => Ok((path, file)),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(Error::OutputExists(path)),
        Err(e) => Err(e.into()),
    }
}

/// Runs one complete recording session: resolve the port, open it, create the
/// output file, and ingest until stopped. The port is always closed by the
/// time this returns, including on error.
pub fn record<P: Write>(
    resolver: &mut dyn PortResolver,
    schema: Schema,
    config: &RecordConfig,
    stop: StopFlag,
    progress: &mut ProgressEcho<P>,
) -> Result<SessionSummary> {
    let port_name = resolver.resolve()?;
    let device = DeviceHandle::open(&port_name, &config.serial)?;
    let now = time::OffsetDateTime::now_utc().to_offset(config.utc_offset);
    let (output, file) = create_output_file(&config.output_dir, &schema, now)?;
    log::info!("Recording {schema} data to {}", output.display());

    let (termination, stats) = ingest(device, file, schema, stop, progress)?;
    Ok(SessionSummary {
        port_name,
        output,
        termination,
        stats,
    })
}

/// Runs a session over `source` with `progress` as the console. The progress
/// line is finished and the outcome announced before `source` is released,
/// so nothing logged on close ends up on the progress line.
fn ingest<S: BufRead, W: Write, P: Write>(
    mut source: S,
    output: W,
    schema: Schema,
    stop: StopFlag,
    progress: &mut ProgressEcho<P>,
) -> Result<(Termination, SessionStats)> {
    let result = Session::new(&mut source, output, schema, stop)?
        .run(|record| progress.update(record));
    progress.finish();
    if let Ok((termination, _)) = &result {
        progress.announce(termination.describe());
    }
    drop(source);
    result
}

/// Single-line progress indicator: each update overwrites the previous one
/// rather than scrolling.
pub struct ProgressEcho<W: Write> {
    out: W,
    last_len: usize,
}

impl<W: Write> ProgressEcho<W> {
    pub fn new(out: W) -> ProgressEcho<W> {
        ProgressEcho { out, last_len: 0 }
    }

    pub fn update(&mut self, record: &Record) {
        let text = format!("Recorded: {}", record.line());
        let padding = self.last_len.saturating_sub(text.chars().count());
        self.last_len = text.chars().count();
        // Progress is purely cosmetic, a broken console must not end the
        // session.
        let _ = write!(self.out, "\r{text}{:padding$}", "");
        let _ = self.out.flush();
    }

    /// Moves past the progress line, so that subsequent output starts on a
    /// fresh line.
    pub fn finish(&mut self) {
        if self.last_len > 0 {
            let _ = writeln!(self.out);
            self.last_len = 0;
        }
    }

    /// Prints a line of its own, below any progress.
    pub fn announce(&mut self, message: &str) {
        self.finish();
        let _ = writeln!(self.out, "{message}");
        let _ = self.out.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::FixedPort;
    use crate::schema::{IMU, SCALE};
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::rc::Rc;

    #[derive(Clone, Copy)]
    enum Step {
        Data(&'static [u8]),
        Timeout,
        /// Ctrl-C while blocked in a read: the read then times out as usual.
        Interrupt,
        Fail,
    }

    /// Fake serial port that plays back a script, then reports end of stream.
    struct ScriptedSource {
        steps: VecDeque<Step>,
        pos: usize,
        stop: StopFlag,
        closed: Rc<Cell<usize>>,
        /// Gets a marker line when the source is closed.
        console: Option<SharedBuffer>,
    }

    impl ScriptedSource {
        fn new(steps: &[Step], stop: &StopFlag) -> (ScriptedSource, Rc<Cell<usize>>) {
            let closed = Rc::new(Cell::new(0));
            (
                ScriptedSource {
                    steps: steps.iter().copied().collect(),
                    pos: 0,
                    stop: stop.clone(),
                    closed: closed.clone(),
                    console: None,
                },
                closed,
            )
        }
    }

    impl Read for ScriptedSource {
        fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
            let available = self.fill_buf()?;
            let n = available.len().min(out.len());
            out[..n].copy_from_slice(&available[..n]);
            self.consume(n);
            Ok(n)
        }
    }

    impl BufRead for ScriptedSource {
        fn fill_buf(&mut self) -> std::io::Result<&[u8]> {
            loop {
                match self.steps.front().copied() {
                    None => return Ok(&[]),
                    Some(Step::Data(data)) => {
                        if self.pos < data.len() {
                            return Ok(&data[self.pos..]);
                        }
                        self.steps.pop_front();
                        self.pos = 0;
                    }
                    Some(Step::Timeout) => {
                        self.steps.pop_front();
                        return Err(std::io::ErrorKind::TimedOut.into());
                    }
                    Some(Step::Interrupt) => {
                        self.steps.pop_front();
                        self.stop.request_stop();
                        return Err(std::io::ErrorKind::TimedOut.into());
                    }
                    Some(Step::Fail) => {
                        self.steps.pop_front();
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::BrokenPipe,
                            "device unplugged",
                        ));
                    }
                }
            }
        }

        fn consume(&mut self, amt: usize) {
            self.pos += amt;
        }
    }

    impl Drop for ScriptedSource {
        fn drop(&mut self) {
            self.closed.set(self.closed.get() + 1);
            if let Some(console) = &mut self.console {
                let _ = console.write_all(b"[closed]\n");
            }
        }
    }

    #[derive(Clone, Default)]
    struct SharedBuffer(Rc<RefCell<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.borrow_mut().write(buf)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuffer {
        fn contents(&self) -> String {
            String::from_utf8(self.0.borrow().clone()).unwrap()
        }
    }

    struct Outcome {
        result: Result<(Termination, SessionStats)>,
        output: String,
        recorded: Vec<String>,
        closed: usize,
    }

    fn run_script(schema: Schema, steps: &[Step], stop: StopFlag) -> Outcome {
        let (source, closed) = ScriptedSource::new(steps, &stop);
        let output = SharedBuffer::default();
        let mut recorded = Vec::new();
        let session = Session::new(source, output.clone(), schema, stop).unwrap();
        let result = session.run(|record| recorded.push(record.line().to_string()));
        Outcome {
            result,
            output: output.contents(),
            recorded,
            closed: closed.get(),
        }
    }

    const IMU_HEADER: &str = "timestamp(ms),accelX,accelY,accelZ,gyroX,gyroY,gyroZ\n";

    #[test]
    fn test_imu_round_trip() {
        let outcome = run_script(
            IMU,
            &[
                Step::Data(b"MPU6050 ready\r\n"),
                Step::Data(b"0,0.1,0.2,0.3,1,2,3\r\n"),
                Step::Data(b"1000,0.4,0.5,0.6,4,5,6\r\n"),
            ],
            StopFlag::new(),
        );
        let (termination, stats) = outcome.result.unwrap();
        assert_eq!(termination, Termination::EndOfStream);
        assert_eq!(stats.accepted, 2);
        assert_eq!(
            outcome.output,
            format!("{IMU_HEADER}0,0.1,0.2,0.3,1,2,3\n1000,0.4,0.5,0.6,4,5,6\n")
        );
        assert_eq!(
            outcome.recorded,
            vec!["0,0.1,0.2,0.3,1,2,3", "1000,0.4,0.5,0.6,4,5,6"]
        );
        assert_eq!(outcome.closed, 1);
    }

    #[test]
    fn test_preamble_is_never_data() {
        // Even a preamble that happens to look like a valid record is dropped.
        let outcome = run_script(
            SCALE,
            &[
                Step::Data(b"1,2\n"),
                Step::Data(b"500,123.45\r\n"),
                Step::Data(b"500,123.45,extra\r\n"),
            ],
            StopFlag::new(),
        );
        assert_eq!(outcome.result.unwrap().1.wrong_arity, 1);
        assert_eq!(outcome.output, "timestamp(ms),weight_g\n500,123.45\n");
    }

    #[test]
    fn test_preamble_spanning_timeouts() {
        // The device may take longer than one read timeout to finish its
        // banner (e.g. while it resets on connect).
        let outcome = run_script(
            SCALE,
            &[
                Step::Timeout,
                Step::Data(b"HX711 cali"),
                Step::Timeout,
                Step::Data(b"brating\r\n"),
                Step::Data(b"500,1"),
                Step::Timeout,
                Step::Data(b"23.45\r\n"),
            ],
            StopFlag::new(),
        );
        let (_, stats) = outcome.result.unwrap();
        assert_eq!(stats.timeouts, 3);
        assert_eq!(outcome.output, "timestamp(ms),weight_g\n500,123.45\n");
    }

    #[test]
    fn test_noise_is_skipped() {
        let outcome = run_script(
            SCALE,
            &[
                Step::Data(b"ready\n"),
                Step::Data(b"100,1.0\n"),
                Step::Data(b"\xff\xfe,\x80\n"),
                Step::Timeout,
                Step::Data(b"\r\n"),
                Step::Data(b"   \n"),
                Step::Data(b"200\n"),
                Step::Data(b"300,3.0,0\n"),
                Step::Data(b"400,4.0\n"),
            ],
            StopFlag::new(),
        );
        let (termination, stats) = outcome.result.unwrap();
        assert_eq!(termination, Termination::EndOfStream);
        assert_eq!(
            stats,
            SessionStats {
                accepted: 2,
                wrong_arity: 2,
                invalid_utf8: 1,
                empty: 2,
                timeouts: 1,
            }
        );
        assert_eq!(stats.dropped(), 3);
        assert_eq!(outcome.output, "timestamp(ms),weight_g\n100,1.0\n400,4.0\n");
    }

    #[test]
    fn test_interrupt_while_blocked() {
        let outcome = run_script(
            IMU,
            &[
                Step::Data(b"ready\n"),
                Step::Data(b"0,0.1,0.2,0.3,1,2,3\n"),
                Step::Data(b"1000,0.4,0.5"),
                Step::Interrupt,
                Step::Data(b",0.6,4,5,6\n"),
                Step::Data(b"2000,0.7,0.8,0.9,7,8,9\n"),
            ],
            StopFlag::new(),
        );
        let (termination, stats) = outcome.result.unwrap();
        assert_eq!(termination, Termination::StoppedByUser);
        assert_eq!(stats.accepted, 1);
        // The half-read line is lost, but never written as a partial row.
        assert_eq!(outcome.output, format!("{IMU_HEADER}0,0.1,0.2,0.3,1,2,3\n"));
        assert_eq!(outcome.closed, 1);
    }

    #[test]
    fn test_stop_before_first_read() {
        let stop = StopFlag::new();
        stop.request_stop();
        let outcome = run_script(SCALE, &[Step::Data(b"ready\n"), Step::Data(b"1,2\n")], stop);
        let (termination, stats) = outcome.result.unwrap();
        assert_eq!(termination, Termination::StoppedByUser);
        assert_eq!(stats, SessionStats::default());
        assert_eq!(outcome.output, "timestamp(ms),weight_g\n");
        assert_eq!(outcome.closed, 1);
    }

    #[test]
    fn test_read_failure_is_fatal() {
        let outcome = run_script(
            SCALE,
            &[
                Step::Data(b"ready\n"),
                Step::Data(b"100,1.0\n"),
                Step::Fail,
                Step::Data(b"200,2.0\n"),
            ],
            StopFlag::new(),
        );
        assert!(matches!(outcome.result, Err(Error::Io(_))));
        assert_eq!(outcome.output, "timestamp(ms),weight_g\n100,1.0\n");
        assert_eq!(outcome.closed, 1);
    }

    #[test]
    fn test_unterminated_final_line() {
        let outcome = run_script(
            SCALE,
            &[Step::Data(b"ready\n"), Step::Data(b"100,1.0\n200,2.0")],
            StopFlag::new(),
        );
        assert_eq!(outcome.result.unwrap().0, Termination::EndOfStream);
        assert_eq!(outcome.output, "timestamp(ms),weight_g\n100,1.0\n200,2.0\n");
    }

    #[test]
    fn test_connect_failure_creates_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = RecordConfig {
            output_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let mut resolver = FixedPort("/dev/this-port-does-not-exist".to_string());
        let mut progress = ProgressEcho::new(std::io::sink());
        let result = record(&mut resolver, SCALE, &config, StopFlag::new(), &mut progress);
        assert!(matches!(result, Err(Error::Connect { .. })));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_create_output_file() {
        let dir = tempfile::tempdir().unwrap();
        let date_time = time::macros::datetime!(2024-03-05 07:08:09 +1);
        let (path, _file) = create_output_file(dir.path(), &IMU, date_time).unwrap();
        assert_eq!(path, dir.path().join("imu_data_20240305_070809.csv"));
        // Files are never overwritten.
        assert!(matches!(
            create_output_file(dir.path(), &IMU, date_time),
            Err(Error::OutputExists(existing)) if existing == path
        ));
    }

    #[test]
    fn test_status_precedes_close() {
        let stop = StopFlag::new();
        let (mut source, closed) = ScriptedSource::new(
            &[
                Step::Data(b"ready\n"),
                Step::Data(b"100,1.0\n"),
                Step::Interrupt,
            ],
            &stop,
        );
        let console = SharedBuffer::default();
        source.console = Some(console.clone());
        let output = SharedBuffer::default();
        let mut progress = ProgressEcho::new(console.clone());

        let (termination, stats) = ingest(source, output.clone(), SCALE, stop, &mut progress).unwrap();
        assert_eq!(termination, Termination::StoppedByUser);
        assert_eq!(stats.accepted, 1);
        assert_eq!(closed.get(), 1);
        assert_eq!(
            console.contents(),
            "\rRecorded: 100,1.0\nRecording stopped by user\n[closed]\n"
        );
        assert_eq!(output.contents(), "timestamp(ms),weight_g\n100,1.0\n");
    }

    #[test]
    fn test_progress_echo() {
        let mut out = Vec::new();
        {
            let mut echo = ProgressEcho::new(&mut out);
            echo.update(&protocol::parse_record("1000,123.45", 2).unwrap());
            echo.update(&protocol::parse_record("2000,1", 2).unwrap());
            echo.finish();
        }
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "\rRecorded: 1000,123.45\rRecorded: 2000,1     \n"
        );
    }

    #[test]
    fn test_serial_config() {
        let config = SerialConfig::default();
        assert_eq!(config.baud_rate, 9600);
        assert_eq!(config.timeout, Duration::from_secs(1));
        let config = config.baud_rate(115_200).timeout(Duration::from_millis(250));
        assert_eq!(config.baud_rate, 115_200);
        assert_eq!(config.timeout, Duration::from_millis(250));
    }
}
