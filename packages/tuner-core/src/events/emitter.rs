//! Event emitter abstraction for decoupling services from observability transport.

use super::AppEvent;

/// Trait for emitting domain events without knowledge of how they are consumed.
pub trait EventEmitter: Send + Sync {
    /// Emits a domain event.
    fn emit(&self, event: AppEvent);
}

/// No-op emitter for tests or embeddings that don't care about events.
pub struct NoopEventEmitter;

impl EventEmitter for NoopEventEmitter {
    fn emit(&self, _event: AppEvent) {}
}

/// Logging emitter; the default for both the supervisor and capture processes.
pub struct LoggingEventEmitter;

impl EventEmitter for LoggingEventEmitter {
    fn emit(&self, event: AppEvent) {
        tracing::debug!(?event, "app_event");
    }
}

#[cfg(test)]
mod tests {
    use super::super::{CaptureEvent, DetectionEvent};
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingEventEmitter {
        detection_count: AtomicUsize,
        capture_count: AtomicUsize,
    }

    impl CountingEventEmitter {
        fn new() -> Self {
            Self {
                detection_count: AtomicUsize::new(0),
                capture_count: AtomicUsize::new(0),
            }
        }
    }

    impl EventEmitter for CountingEventEmitter {
        fn emit(&self, event: AppEvent) {
            match event {
                AppEvent::Detection(_) => {
                    self.detection_count.fetch_add(1, Ordering::SeqCst);
                }
                AppEvent::Capture(_) => {
                    self.capture_count.fetch_add(1, Ordering::SeqCst);
                }
                AppEvent::Supervisor(_) => {}
            }
        }
    }

    #[test]
    fn counting_emitter_tracks_events_by_category() {
        let emitter = Arc::new(CountingEventEmitter::new());

        emitter.emit(AppEvent::Detection(DetectionEvent::EnteredWaiting {
            timestamp: 0,
        }));
        emitter.emit(AppEvent::Detection(DetectionEvent::NoMatch { timestamp: 0 }));
        emitter.emit(AppEvent::Capture(CaptureEvent::StreamStarted {
            sample_rate: 44100,
            channels: 2,
            timestamp: 0,
        }));

        assert_eq!(emitter.detection_count.load(Ordering::SeqCst), 2);
        assert_eq!(emitter.capture_count.load(Ordering::SeqCst), 1);
    }
}
