//! mDNS presence: advertising this presenter and finding others.
//!
//! LANCast sessions announce themselves as `_lancast._tcp.local.` services.
//! The TXT record carries the room name, the presenter's display name, and
//! the software version.  Viewers (and other presenters) browse the same
//! service type and resolve each record to a single dialable address via
//! [`best_address`].
//!
//! The instance name embeds a millisecond timestamp so that restarting a
//! session with the same room name never collides with the stale record a
//! neighbor may still be caching.

use std::collections::HashSet;
use std::net::IpAddr;
use std::time::Duration;

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use lancast_core::domain::ranker::best_address;
use lancast_core::protocol::messages::now_ms;

/// The DNS-SD service type all LANCast presenters register under.
pub const SERVICE_TYPE: &str = "_lancast._tcp.local.";

/// Error type for mDNS operations.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The mDNS daemon could not be created (no multicast-capable interface,
    /// socket permission denied).
    #[error("failed to start mDNS daemon")]
    Daemon(#[source] mdns_sd::Error),

    /// Registering the service record failed.
    #[error("failed to publish session \"{room}\"")]
    Publish {
        room: String,
        #[source]
        source: mdns_sd::Error,
    },

    /// Starting a browse operation failed.
    #[error("failed to browse for sessions")]
    Browse(#[source] mdns_sd::Error),
}

/// A presenter session resolved from the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPresenter {
    /// The presenter's display name (from the TXT record).
    pub name: String,
    /// The room name (from the TXT record).
    pub room: String,
    /// The best dialable address, or the bare hostname when no usable
    /// address was present in the record.
    pub address: String,
    /// The signaling port.
    pub port: u16,
}

// ── Service ───────────────────────────────────────────────────────────────────

/// Owns the mDNS daemon and tracks what we have registered.
///
/// One browse operation at a time: calling [`Self::discover`] while a
/// continuous discovery stream is open will tear the stream down when the
/// one-shot scan finishes.
pub struct DiscoveryService {
    daemon: ServiceDaemon,
    advertised: Option<String>,
    browsing: bool,
}

impl DiscoveryService {
    /// Starts the mDNS daemon.
    ///
    /// # Errors
    ///
    /// [`DiscoveryError::Daemon`] when no multicast socket can be opened.
    pub fn new() -> Result<Self, DiscoveryError> {
        let daemon = ServiceDaemon::new().map_err(DiscoveryError::Daemon)?;
        Ok(Self {
            daemon,
            advertised: None,
            browsing: false,
        })
    }

    /// Publishes this session on the LAN.
    ///
    /// Re-advertising replaces the previous record.  When `preferred_addr`
    /// is `None` the daemon attaches every address of every up interface and
    /// keeps the record current as interfaces come and go.
    pub fn advertise(
        &mut self,
        room: &str,
        presenter: &str,
        port: u16,
        preferred_addr: Option<IpAddr>,
    ) -> Result<(), DiscoveryError> {
        self.stop_advertising();

        let instance = format!("{room}-{}", now_ms());
        let host = format!("{}.local.", host_label(&instance));
        let props = [
            ("room", room),
            ("presenter", presenter),
            ("version", env!("CARGO_PKG_VERSION")),
        ];
        let publish_err = |source| DiscoveryError::Publish {
            room: room.to_string(),
            source,
        };

        let service = match preferred_addr {
            Some(ip) => ServiceInfo::new(
                SERVICE_TYPE,
                &instance,
                &host,
                ip.to_string().as_str(),
                port,
                &props[..],
            )
            .map_err(publish_err)?,
            None => ServiceInfo::new(SERVICE_TYPE, &instance, &host, "", port, &props[..])
                .map_err(publish_err)?
                .enable_addr_auto(),
        };

        let fullname = service.get_fullname().to_string();
        self.daemon.register(service).map_err(publish_err)?;
        info!("advertising \"{room}\" on port {port} as {fullname}");
        self.advertised = Some(fullname);
        Ok(())
    }

    /// Withdraws our service record.  Safe to call when nothing is
    /// advertised.
    pub fn stop_advertising(&mut self) {
        if let Some(fullname) = self.advertised.take() {
            match self.daemon.unregister(&fullname) {
                Ok(_) => info!("withdrew {fullname}"),
                Err(e) => warn!("failed to unregister {fullname}: {e}"),
            }
        }
    }

    /// One-shot scan: collects every presenter resolvable within `window`.
    ///
    /// Our own record is filtered out, and a presenter reachable at several
    /// addresses is reported once (first resolution wins).  Always returns
    /// `Ok` once browsing has started; a quiet network is an empty list, not
    /// an error.
    pub async fn discover(
        &mut self,
        window: Duration,
    ) -> Result<Vec<DiscoveredPresenter>, DiscoveryError> {
        let receiver = self.daemon.browse(SERVICE_TYPE).map_err(DiscoveryError::Browse)?;
        self.browsing = true;

        let mut found = Vec::new();
        let mut seen = HashSet::new();
        let deadline = tokio::time::Instant::now() + window;

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            let event = match tokio::time::timeout(remaining, receiver.recv_async()).await {
                Ok(Ok(event)) => event,
                Ok(Err(_)) => break,
                Err(_) => break,
            };
            if let ServiceEvent::ServiceResolved(service) = event {
                if let Some(presenter) =
                    presenter_from_record(&service, self.advertised.as_deref())
                {
                    if seen.insert(dedup_key(&presenter.address, presenter.port)) {
                        debug!(
                            "resolved \"{}\" at {}:{}",
                            presenter.room, presenter.address, presenter.port
                        );
                        found.push(presenter);
                    }
                }
            }
        }

        self.stop_discovery();
        Ok(found)
    }

    /// Open-ended discovery: each newly resolved presenter is delivered on
    /// the returned channel until [`Self::stop_discovery`] is called or the
    /// receiver is dropped.
    pub fn start_continuous_discovery(
        &mut self,
    ) -> Result<mpsc::Receiver<DiscoveredPresenter>, DiscoveryError> {
        let receiver = self.daemon.browse(SERVICE_TYPE).map_err(DiscoveryError::Browse)?;
        self.browsing = true;
        let own_fullname = self.advertised.clone();
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            let mut seen = HashSet::new();
            while let Ok(event) = receiver.recv_async().await {
                if let ServiceEvent::ServiceResolved(service) = event {
                    if let Some(presenter) =
                        presenter_from_record(&service, own_fullname.as_deref())
                    {
                        if seen.insert(dedup_key(&presenter.address, presenter.port))
                            && tx.send(presenter).await.is_err()
                        {
                            break;
                        }
                    }
                }
            }
            debug!("continuous discovery stream ended");
        });

        Ok(rx)
    }

    /// Stops the active browse, if any.  The daemon then closes the event
    /// channel, which ends the continuous discovery task.
    pub fn stop_discovery(&mut self) {
        if self.browsing {
            if let Err(e) = self.daemon.stop_browse(SERVICE_TYPE) {
                debug!("stop browse: {e}");
            }
            self.browsing = false;
        }
    }

    /// Withdraws everything and shuts the daemon down.
    pub fn shutdown(&mut self) {
        self.stop_advertising();
        self.stop_discovery();
        if let Err(e) = self.daemon.shutdown() {
            debug!("mDNS daemon shutdown: {e}");
        }
    }
}

// ── Record parsing ────────────────────────────────────────────────────────────

/// Converts a resolved service record into a [`DiscoveredPresenter`].
///
/// Returns `None` for our own record.  Missing TXT keys fall back to the
/// instance label so a record published by an older version still shows up
/// with something readable.
fn presenter_from_record(
    service: &ServiceInfo,
    own_fullname: Option<&str>,
) -> Option<DiscoveredPresenter> {
    if own_fullname == Some(service.get_fullname()) {
        return None;
    }
    let instance = service.get_fullname().split('.').next().unwrap_or_default();
    let room = service
        .get_property_val_str("room")
        .unwrap_or(instance)
        .to_string();
    let name = service
        .get_property_val_str("presenter")
        .unwrap_or(instance)
        .to_string();
    let address = display_address(
        service.get_addresses().iter().copied(),
        service.get_hostname(),
    );
    Some(DiscoveredPresenter {
        name,
        room,
        address,
        port: service.get_port(),
    })
}

/// Picks the best address from the record, falling back to the bare
/// hostname when the record carries nothing dialable.
fn display_address(addresses: impl IntoIterator<Item = IpAddr>, hostname: &str) -> String {
    match best_address(addresses) {
        Some(ip) => ip.to_string(),
        None => hostname.trim_end_matches('.').to_string(),
    }
}

fn dedup_key(address: &str, port: u16) -> String {
    format!("{address}:{port}")
}

/// Turns an arbitrary instance name into a valid DNS host label.
fn host_label(instance: &str) -> String {
    let label: String = instance
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    label.trim_matches('-').to_string()
}

// ── Tests ─────────────────────────────────────────────────────────────────────
