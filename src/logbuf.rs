// logbuf.rs

use std::collections::VecDeque;
use std::sync::Mutex as StdMutex;

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

pub const LOG_BUF_SIZE: usize = 8192;

static LOG_BUF: LogBuffer = LogBuffer::new(LOG_BUF_SIZE);

/// Text buffer keeping the most recent lines up to `capacity` bytes.
pub struct LogBuffer {
    capacity: usize,
    buf: StdMutex<VecDeque<u8>>,
}

impl LogBuffer {
    pub const fn new(capacity: usize) -> Self {
        Self {
            capacity,
            buf: StdMutex::new(VecDeque::new()),
        }
    }

    pub fn push_line(&self, line: &str) {
        let mut buf = self.buf.lock().unwrap_or_else(|e| e.into_inner());
        buf.extend(line.as_bytes());
        buf.push_back(b'\n');

        if buf.len() > self.capacity {
            // drop whole lines from the front
            let excess = buf.len() - self.capacity;
            let cut = buf
                .iter()
                .skip(excess)
                .position(|b| *b == b'\n')
                .map(|p| excess + p + 1)
                .unwrap_or(buf.len());
            buf.drain(..cut);
        }
    }

    pub fn contents(&self) -> String {
        let buf = self.buf.lock().unwrap_or_else(|e| e.into_inner());
        let (a, b) = buf.as_slices();
        let mut out = String::from_utf8_lossy(a).into_owned();
        out.push_str(&String::from_utf8_lossy(b));
        out
    }

    pub fn len(&self) -> usize {
        self.buf.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Logger that copies every record into the global buffer before passing it on.
pub struct RingLogger<L> {
    inner: L,
    buf: &'static LogBuffer,
}

impl<L: Log> RingLogger<L> {
    pub fn new(inner: L) -> Self {
        Self { inner, buf: &LOG_BUF }
    }

    pub fn with_buffer(inner: L, buf: &'static LogBuffer) -> Self {
        Self { inner, buf }
    }
}

impl<L: Log> Log for RingLogger<L> {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.inner.enabled(metadata)
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        self.inner.log(record);
        self.buf
            .push_line(&format!("{} {}: {}", record.level(), record.target(), record.args()));
    }

    fn flush(&self) {
        self.inner.flush();
    }
}

pub fn init<L: Log + 'static>(inner: L, level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_boxed_logger(Box::new(RingLogger::new(inner)))?;
    log::set_max_level(level);
    Ok(())
}

/// Recent log text, oldest line first.
pub fn contents() -> String {
    LOG_BUF.contents()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use log::Level;

    use super::*;

    struct Counting {
        max: Level,
        seen: AtomicUsize,
    }

    impl Log for Counting {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.level() <= self.max
        }
        fn log(&self, _record: &Record) {
            self.seen.fetch_add(1, Ordering::Relaxed);
        }
        fn flush(&self) {}
    }

    #[test]
    fn keeps_whole_recent_lines() {
        let buf = LogBuffer::new(16);
        buf.push_line("first line");
        buf.push_line("second");
        buf.push_line("third");
        assert_eq!(buf.contents(), "second\nthird\n");
        assert!(buf.len() <= 16);
    }

    #[test]
    fn oversized_line_empties_buffer() {
        let buf = LogBuffer::new(8);
        buf.push_line("short");
        buf.push_line("this line is far too long");
        assert!(buf.is_empty());
    }

    #[test]
    fn records_pass_through_and_are_kept() {
        static BUF: LogBuffer = LogBuffer::new(1024);
        let logger = RingLogger::with_buffer(
            Counting {
                max: Level::Info,
                seen: AtomicUsize::new(0),
            },
            &BUF,
        );

        for (level, text) in [(Level::Info, "hello"), (Level::Debug, "noise"), (Level::Error, "boom")] {
            logger.log(
                &Record::builder()
                    .level(level)
                    .target("esp_env")
                    .args(format_args!("{text}"))
                    .build(),
            );
        }

        assert_eq!(logger.inner.seen.load(Ordering::Relaxed), 2);
        assert_eq!(BUF.contents(), "INFO esp_env: hello\nERROR esp_env: boom\n");
    }
}

// EOF
