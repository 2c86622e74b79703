//! Metrics and observability for blobtail.
//!
//! - `events`: internal event types and the `InternalEvent` trait
//! - `server`: Prometheus recorder and the HTTP endpoint

pub mod events;
pub mod server;

pub use server::init;

/// Emit an internal event.
///
/// Calls `InternalEvent::emit()` on the given event, which records the
/// corresponding Prometheus metric.
///
/// ```ignore
/// use blobtail::emit;
/// use blobtail::metrics::events::EventsEmitted;
///
/// emit!(EventsEmitted { count: 10 });
/// ```
#[macro_export]
macro_rules! emit {
    ($event:expr) => {
        $crate::metrics::events::InternalEvent::emit($event)
    };
}
