//! Background capture of child process output.

use std::{
    fs::File,
    io::{BufRead, BufReader},
    os::unix::prelude::{FromRawFd, IntoRawFd},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::sleep,
    time::{Duration, Instant},
};

/// Handle to output accumulated by a background reader thread.
#[derive(Debug, Clone)]
pub struct OutputHandle {
    buf: Arc<Mutex<Vec<u8>>>,
    finished: Arc<AtomicBool>,
}

impl OutputHandle {
    /// Drain everything captured since the last call.
    pub fn take_current(&self) -> Vec<u8> {
        let mut buf = self.buf.lock().unwrap();
        buf.split_off(0)
    }

    pub fn clear(&self) {
        self.buf.lock().unwrap().clear();
    }

    /// Whether the underlying stream has reached EOF.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Relaxed)
    }

    /// Drain the stream, waiting at most `max` for it to reach EOF.
    pub fn wait_finished(self, max: Duration) -> Vec<u8> {
        let deadline = Instant::now() + max;
        while !self.is_finished() && Instant::now() < deadline {
            sleep(Duration::from_millis(10));
        }
        self.take_current()
    }
}

/// Spawn a thread reading `f` line by line into a shared buffer.
/// With `echo` set every line is also printed, for debug runs.
pub fn capture<T: IntoRawFd>(f: T, echo: bool) -> OutputHandle {
    let fd = f.into_raw_fd();
    let f = unsafe { File::from_raw_fd(fd) };
    let buf = Arc::new(Mutex::new(Vec::with_capacity(4096)));
    let finished = Arc::new(AtomicBool::new(false));
    let handle = OutputHandle {
        buf: Arc::clone(&buf),
        finished: Arc::clone(&finished),
    };

    std::thread::spawn(move || {
        let mut line = String::with_capacity(256);
        let mut reader = BufReader::new(f);
        while let Ok(sz) = reader.read_line(&mut line) {
            if sz == 0 {
                break;
            }
            buf.lock().unwrap().extend(line[..sz].as_bytes());
            if echo {
                print!("{}", &line[..sz]);
            }
            line.clear();
        }
        finished.store(true, Ordering::Relaxed);
    });

    handle
}
