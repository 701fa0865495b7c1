//! Tracing layer that forwards log events onto the in-process [`Bus`]
//! as [`Message::LogLine`], so the `/events` WebSocket surface can
//! stream daemon logs alongside state-change events.

use crate::bus::{Bus, Message};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

pub struct BusLogLayer {
    bus: Bus,
}

impl BusLogLayer {
    pub fn new(bus: Bus) -> Self {
        Self { bus }
    }
}

impl<S> Layer<S> for BusLogLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let level = match *event.metadata().level() {
            Level::ERROR => "error",
            Level::WARN => "warn",
            Level::INFO => "info",
            Level::DEBUG => "debug",
            Level::TRACE => "debug",
        };

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        if let Some(message) = visitor.message {
            self.bus.publish(Message::LogLine {
                level: level.to_string(),
                target: event.metadata().target().to_string(),
                message,
            });
        }
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: Option<String>,
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{value:?}"));
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        }
    }
}
