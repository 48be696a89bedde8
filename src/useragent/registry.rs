use super::events::{EventQueue, UserAgentEvent};
use crate::{
    config::RegistrationConfig,
    dialog::registration::Registration,
    Error, Result,
};
use async_trait::async_trait;
use rsip::StatusCodeKind;
use std::{sync::Arc, time::Duration};
use tokio::{select, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// One registrar binding, refreshed by [`refresh_registration`].
#[async_trait]
pub trait Registrar: Send {
    fn server(&self) -> &rsip::Uri;
    /// Register for `expires` seconds and return what the registrar granted.
    async fn register(&mut self, expires: u32) -> Result<u32>;
    async fn unregister(&mut self) -> Result<()>;
}

pub struct RegistrarClient {
    registration: Registration,
    server: rsip::Uri,
}

impl RegistrarClient {
    pub fn new(registration: Registration, server: rsip::Uri) -> Self {
        RegistrarClient {
            registration,
            server,
        }
    }
}

#[async_trait]
impl Registrar for RegistrarClient {
    fn server(&self) -> &rsip::Uri {
        &self.server
    }

    async fn register(&mut self, expires: u32) -> Result<u32> {
        let resp = self
            .registration
            .register(self.server.clone(), expires)
            .await?;
        if resp.status_code.kind() != StatusCodeKind::Successful {
            return Err(Error::RegistrationError(format!(
                "{} answered {}",
                self.server, resp.status_code
            )));
        }
        Ok(self.registration.expires())
    }

    async fn unregister(&mut self) -> Result<()> {
        let resp = self.registration.unregister(self.server.clone()).await?;
        info!(server = %self.server, "unregistered: {}", resp.status_code);
        Ok(())
    }
}

/// Re-register ahead of expiry.
fn refresh_interval(granted: u32) -> Duration {
    Duration::from_secs((granted as u64 * 9 / 10).max(1))
}

/// Keep `registrar` bound until `cancel_token` fires, then unregister.
///
/// A failed attempt is retried after `initial_backoff`, doubling up to
/// `max_backoff`. When `max_retries` retries in a row have failed a single
/// `RegistrationLost` is queued and refreshing stops.
pub(super) async fn refresh_registration<R: Registrar>(
    mut registrar: R,
    config: RegistrationConfig,
    events: Arc<EventQueue>,
    cancel_token: CancellationToken,
) {
    let server = registrar.server().clone();
    let mut registered = false;
    let mut failures = 0u32;
    loop {
        let wait = match registrar.register(config.expires).await {
            Ok(granted) => {
                info!(%server, granted, "registered");
                registered = true;
                failures = 0;
                events.push(UserAgentEvent::Registered {
                    server: server.clone(),
                    expires: granted,
                });
                refresh_interval(granted)
            }
            Err(e) => {
                warn!(%server, failures, "registration failed: {}", e);
                if failures >= config.max_retries {
                    events.push(UserAgentEvent::RegistrationLost {
                        server: server.clone(),
                        attempts: failures + 1,
                    });
                    return;
                }
                let backoff = config.backoff(failures);
                failures += 1;
                backoff
            }
        };
        select! {
            _ = cancel_token.cancelled() => break,
            _ = sleep(wait) => {}
        }
    }
    if registered {
        if let Err(e) = registrar.unregister().await {
            warn!(%server, "unregister failed: {}", e);
        }
    }
}
