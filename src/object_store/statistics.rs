//! Transfer throughput sampling.
//!
//! The transferring thread only bumps an atomic byte counter. A separate observer
//! thread samples it on a fixed interval and reports to the callbacks.

use super::{TransferCallbacks, TransferStatistics};
use crate::clock::Clock;
use std::io::{self, Read};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Reader that counts the bytes passing through it
pub struct CountingReader<R> {
    inner: R,
    counter: Arc<AtomicU64>,
}

impl<R: Read> CountingReader<R> {
    pub fn new(inner: R, counter: Arc<AtomicU64>) -> Self {
        Self { inner, counter }
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.inner.read(buf)?;
        self.counter.fetch_add(read as u64, Ordering::Relaxed);
        Ok(read)
    }
}

/// Background sampler; stops and joins when dropped
pub struct StatisticsObserver {
    stop: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl StatisticsObserver {
    pub fn spawn(
        counter: Arc<AtomicU64>,
        expected: u64,
        interval: Duration,
        clock: Arc<dyn Clock>,
        callbacks: Arc<dyn TransferCallbacks>,
    ) -> std::io::Result<Self> {
        let (stop, stopped) = mpsc::channel::<()>();

        let handle = thread::Builder::new()
            .name("transfer-statistics".to_string())
            .spawn(move || {
                let mut previous = 0u64;
                let report = |previous: &mut u64| {
                    let transferred = counter.load(Ordering::Relaxed);
                    callbacks.on_statistics(TransferStatistics {
                        time: clock.now(),
                        transferred,
                        expected,
                        transferred_this_period: transferred.saturating_sub(*previous),
                    });
                    *previous = transferred;
                };

                loop {
                    match stopped.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => report(&mut previous),
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                report(&mut previous);
            })?;

        Ok(Self {
            stop: Some(stop),
            handle: Some(handle),
        })
    }
}

impl Drop for StatisticsObserver {
    fn drop(&mut self) {
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::error::CourierError;
    use std::io::Cursor;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        samples: Mutex<Vec<TransferStatistics>>,
    }

    impl TransferCallbacks for Recorder {
        fn on_statistics(&self, statistics: TransferStatistics) {
            self.samples.lock().unwrap().push(statistics);
        }
        fn on_informative_event(&self, _message: &str) {}
        fn on_error(&self, _error: &CourierError) {}
        fn on_file_skipped(&self) {}
        fn on_file_successfully_uploaded(&self) {}
    }

    #[test]
    fn test_counting_reader() {
        let counter = Arc::new(AtomicU64::new(0));
        let mut reader = CountingReader::new(Cursor::new(vec![1u8; 1000]), counter.clone());
        let mut sink = Vec::new();
        reader.read_to_end(&mut sink).unwrap();
        assert_eq!(counter.load(Ordering::Relaxed), 1000);
    }

    #[test]
    fn test_observer_reports_final_sample_on_drop() {
        let counter = Arc::new(AtomicU64::new(0));
        let recorder = Arc::new(Recorder::default());

        let observer = StatisticsObserver::spawn(
            counter.clone(),
            100,
            Duration::from_millis(10),
            Arc::new(SystemClock),
            recorder.clone(),
        )
        .unwrap();

        counter.store(40, Ordering::Relaxed);
        thread::sleep(Duration::from_millis(50));
        counter.store(100, Ordering::Relaxed);
        drop(observer);

        let samples = recorder.samples.lock().unwrap();
        let last = samples.last().unwrap();
        assert_eq!(last.transferred, 100);
        assert_eq!(last.expected, 100);
        let total: u64 = samples.iter().map(|s| s.transferred_this_period).sum();
        assert_eq!(total, 100);
    }
}
