use futures::prelude::*;
pub use kube::runtime::watcher::{Event, Result};
use std::pin::Pin;
use tokio::time;
use tracing::{info, Instrument};

pub type EventStream<T> = Pin<Box<dyn Stream<Item = Result<Event<T>>> + Send + 'static>>;

/// Wraps an event stream that never terminates.
///
/// Failures are logged and the inner stream is polled again after a delay;
/// the kube watcher responds by re-listing, so observation resumes with a
/// fresh list-then-watch.
pub struct Watch<T> {
    span: tracing::Span,
    rx: EventStream<T>,
}

// === impl Watch ===

impl<T, W> From<W> for Watch<T>
where
    W: Stream<Item = Result<Event<T>>> + Send + 'static,
{
    fn from(watch: W) -> Self {
        Self::new(watch.boxed())
    }
}

impl<T> Watch<T> {
    const RESTART_DELAY: time::Duration = time::Duration::from_secs(1);

    /// Failures are logged in the span that is current when the watch is
    /// created.
    pub fn new(rx: EventStream<T>) -> Watch<T> {
        Self {
            rx,
            span: tracing::Span::current(),
        }
    }

    /// Receive the next event in the stream.
    ///
    /// If the stream fails, log the error and sleep before polling for a
    /// reset event. Returns `None` only if the inner stream ends.
    pub async fn recv(&mut self) -> Option<Event<T>> {
        loop {
            let ev = self.rx.next().instrument(self.span.clone()).await?;

            match ev {
                Ok(ev) => return Some(ev),
                Err(error) => {
                    info!(parent: &self.span, %error, "Failed");
                    time::sleep(Self::RESTART_DELAY).await;
                    info!(parent: &self.span, "Restarting");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::runtime::watcher;

    #[tokio::test(start_paused = true)]
    async fn recovers_from_errors() {
        let events: Vec<Result<Event<u32>>> = vec![
            Err(watcher::Error::NoResourceVersion),
            Ok(Event::Init),
            Ok(Event::InitApply(1)),
            Err(watcher::Error::NoResourceVersion),
            Ok(Event::InitDone),
            Ok(Event::Apply(2)),
        ];
        let mut watch = Watch::from(stream::iter(events));

        let start = time::Instant::now();
        assert!(matches!(watch.recv().await, Some(Event::Init)));
        assert!(start.elapsed() >= Watch::<u32>::RESTART_DELAY);
        assert!(matches!(watch.recv().await, Some(Event::InitApply(1))));
        assert!(matches!(watch.recv().await, Some(Event::InitDone)));
        assert!(start.elapsed() >= 2 * Watch::<u32>::RESTART_DELAY);
        assert!(matches!(watch.recv().await, Some(Event::Apply(2))));
        assert!(watch.recv().await.is_none());
    }
}
