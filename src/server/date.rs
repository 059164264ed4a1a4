//! Cached `Date` header value.

use crate::server::server_impl::Shutdown;
use arc_swap::ArcSwap;
use std::{sync::Arc, time::SystemTime};
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Interval between two refreshes. A cached date is never older than this.
pub const DATE_TICK: Duration = Duration::from_secs(1);

/// Process-wide `Date` header value in IMF-fixdate format
/// (`Sun, 06 Nov 1994 08:49:37 GMT`).
///
/// One ticker task writes, every connection reads. Reads are lock-free and
/// may observe a value up to [`DATE_TICK`] old.
#[derive(Debug, Clone)]
pub struct DateCache {
    current: Arc<ArcSwap<String>>,
}

impl Default for DateCache {
    fn default() -> Self {
        Self::new()
    }
}

impl DateCache {
    pub fn new() -> Self {
        Self {
            current: Arc::new(ArcSwap::from_pointee(Self::now())),
        }
    }

    /// Re-formats the current time and publishes it.
    #[inline]
    pub fn refresh(&self) {
        self.current.store(Arc::new(Self::now()));
    }

    /// Returns the value currently published.
    #[inline]
    pub fn current(&self) -> Arc<String> {
        self.current.load_full()
    }

    #[inline(always)]
    pub(crate) fn write_header(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(b"Date: ");
        buffer.extend_from_slice(self.current.load().as_bytes());
        buffer.extend_from_slice(b"\r\n");
    }

    /// Refreshes the value every [`DATE_TICK`] until `shutdown` fires.
    pub(crate) async fn run_ticker(self, mut shutdown: Shutdown) {
        let mut ticker = interval(DATE_TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.refresh(),
                _ = shutdown.wait() => break,
            }
        }

        log::debug!("date ticker stopped");
    }

    #[inline]
    fn now() -> String {
        httpdate::fmt_http_date(SystemTime::now())
    }
}

#[cfg(test)]
mod date_tests {
    use super::*;
    use crate::tools::*;

    #[test]
    fn header_format() {
        let cache = DateCache::new();
        let mut buffer = Vec::new();
        cache.write_header(&mut buffer);

        let line = str_op(&buffer);
        assert!(line.starts_with("Date: ") && line.ends_with(" GMT\r\n"), "{line}");
        assert_eq!(line.len(), "Date: Sun, 06 Nov 1994 08:49:37 GMT\r\n".len());
        assert!(httpdate::parse_http_date(&line[6..line.len() - 2]).is_ok());
    }

    #[test]
    fn refresh_publishes_new_value() {
        let cache = DateCache::new();
        let reader = cache.clone();
        let before = reader.current();

        cache.refresh();
        let after = reader.current();

        assert!(!Arc::ptr_eq(&before, &after));
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_stops_on_shutdown() {
        let shutdown = Shutdown::new();
        let cache = DateCache::new();

        let ticker = tokio::spawn(cache.clone().run_ticker(shutdown.clone()));
        tokio::time::sleep(DATE_TICK * 3).await;

        shutdown.trigger();
        ticker.await.unwrap();
    }
}
