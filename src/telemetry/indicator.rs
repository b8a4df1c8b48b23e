use parking_lot::Mutex;
use tracing::{debug, warn};

use super::message::Message;
use crate::mqtt::router::MessageCallback;

/// What an on/off indicator currently shows.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IndicatorState {
    pub is_on: bool,
    pub last_message: Option<Message>,
    /// Parse error of the most recent payload, cleared by the next valid one.
    pub error: Option<String>,
}

impl IndicatorState {
    pub fn status_text(&self) -> &'static str {
        if self.is_on {
            "ON"
        } else {
            "OFF"
        }
    }
}

/// On/off view of one device variable, fed by a topic subscription.
///
/// Register it with [`crate::mqtt::MqttHandler::subscribe`] wrapped in an `Arc`.
/// Messages for other variables are ignored when a filter is set.
#[derive(Debug, Default)]
pub struct VariableIndicator {
    variable: Option<String>,
    state: Mutex<IndicatorState>,
}

impl VariableIndicator {
    pub fn new(variable: Option<String>) -> Self {
        Self {
            variable,
            state: Mutex::new(IndicatorState::default()),
        }
    }

    pub fn variable(&self) -> Option<&str> {
        self.variable.as_deref()
    }

    pub fn state(&self) -> IndicatorState {
        self.state.lock().clone()
    }

    pub fn is_on(&self) -> bool {
        self.state.lock().is_on
    }

    pub fn status_text(&self) -> &'static str {
        self.state.lock().status_text()
    }
}

impl MessageCallback for VariableIndicator {
    fn on_message(&self, payload: &str, topic: &str) -> color_eyre::Result<()> {
        let message = match Message::parse(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!("Indicator on {} got an invalid payload: {}", topic, e);
                self.state.lock().error = Some(e.to_string());
                return Err(e.into());
            }
        };

        if let Some(variable) = &self.variable {
            if message.variable() != variable {
                debug!("Ignoring variable {} on {}", message.variable(), topic);
                return Ok(());
            }
        }

        let mut state = self.state.lock();
        state.is_on = message.is_on();
        state.last_message = Some(message);
        state.error = None;
        Ok(())
    }
}
