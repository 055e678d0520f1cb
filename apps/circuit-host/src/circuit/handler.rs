use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::error;

use super::CircuitId;
use crate::error::{CircuitError, HandlerFailure};

/// Observer of circuit lifecycle transitions.
///
/// Every method defaults to a no-op so implementors only override the hooks
/// they care about.
#[async_trait]
pub trait CircuitHandler: Send + Sync {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn on_circuit_opened(&self, _circuit: &CircuitId) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_connection_up(&self, _circuit: &CircuitId) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs when a disconnected circuit is picked up again by a new connection.
    async fn on_circuit_resumed(&self, _circuit: &CircuitId) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_connection_down(&self, _circuit: &CircuitId) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_circuit_closed(&self, _circuit: &CircuitId) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerHook {
    CircuitOpened,
    ConnectionUp,
    CircuitResumed,
    ConnectionDown,
    CircuitClosed,
}

impl HandlerHook {
    pub fn as_str(self) -> &'static str {
        match self {
            HandlerHook::CircuitOpened => "circuit_opened",
            HandlerHook::ConnectionUp => "connection_up",
            HandlerHook::CircuitResumed => "circuit_resumed",
            HandlerHook::ConnectionDown => "connection_down",
            HandlerHook::CircuitClosed => "circuit_closed",
        }
    }
}

impl fmt::Display for HandlerHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runs `hooks` in order across every handler. A failing handler never stops
/// the rest; all failures come back as one `HandlerFailed`.
pub(crate) async fn invoke_handlers(
    handlers: &[Arc<dyn CircuitHandler>],
    circuit: &CircuitId,
    hooks: &[HandlerHook],
) -> Result<(), CircuitError> {
    let mut failures = Vec::new();
    for &hook in hooks {
        for handler in handlers {
            let result = match hook {
                HandlerHook::CircuitOpened => handler.on_circuit_opened(circuit).await,
                HandlerHook::ConnectionUp => handler.on_connection_up(circuit).await,
                HandlerHook::CircuitResumed => handler.on_circuit_resumed(circuit).await,
                HandlerHook::ConnectionDown => handler.on_connection_down(circuit).await,
                HandlerHook::CircuitClosed => handler.on_circuit_closed(circuit).await,
            };
            if let Err(err) = result {
                error!(
                    target = "circuit_host::circuit",
                    circuit = %circuit,
                    handler = handler.name(),
                    hook = hook.as_str(),
                    error = %err,
                    "circuit handler failed"
                );
                failures.push(HandlerFailure {
                    handler: handler.name().to_string(),
                    hook,
                    message: format!("{err:#}"),
                });
            }
        }
    }
    if failures.is_empty() {
        Ok(())
    } else {
        Err(CircuitError::HandlerFailed { failures })
    }
}
