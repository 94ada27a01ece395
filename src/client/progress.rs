//! Terminal spinner shown while a transcription is running.
//!
//! The spinner lives on its own thread and is owned by a guard. Dropping the
//! guard stops the thread, waits for it and clears the line, so the terminal is
//! left clean on every exit path, early returns and `?` included.

use std::io::{IsTerminal, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const FRAMES: [char; 4] = ['|', '/', '-', '\\'];
const FRAME_INTERVAL: Duration = Duration::from_millis(100);

pub struct Spinner {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    width: usize,
}

impl Spinner {
    /// Start spinning on stderr, unless `enabled` is false or stderr is not a terminal.
    pub fn start(message: &str, enabled: bool) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let width = message.chars().count() + 2;

        let handle = (enabled && std::io::stderr().is_terminal()).then(|| {
            let stop = stop.clone();
            let message = message.to_string();
            std::thread::spawn(move || {
                for frame in FRAMES.iter().cycle() {
                    if stop.load(Ordering::SeqCst) {
                        break;
                    }
                    let mut stderr = std::io::stderr().lock();
                    let _ = write!(stderr, "\r{} {}", message, frame);
                    let _ = stderr.flush();
                    drop(stderr);
                    std::thread::sleep(FRAME_INTERVAL);
                }
            })
        });

        Self { stop, handle, width }
    }

    #[cfg(test)]
    fn is_running(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for Spinner {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
            let mut stderr = std::io::stderr().lock();
            let _ = write!(stderr, "\r{}\r", " ".repeat(self.width));
            let _ = stderr.flush();
        }
    }
}
