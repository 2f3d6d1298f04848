use super::TransportKind;

/// Outcome of recording one failed connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    NextPort,
    /// Every port failed on the primary transport; retry them with polling.
    Fallback,
    Exhausted,
}

/// Reconnection cursor: walks every port under the preferred transport kind,
/// then every port under the fallback kind, and never repeats a combination
/// within one campaign.
#[derive(Debug, Clone)]
pub struct PortCursor {
    ports: Vec<u16>,
    preferred: TransportKind,
    kind: TransportKind,
    port_index: usize,
    retry_count: u32,
    max_retries: Option<u32>,
}

impl PortCursor {
    pub fn new(ports: &[u16], preferred: TransportKind, max_retries: Option<u32>) -> Self {
        Self {
            ports: ports.to_vec(),
            preferred,
            kind: preferred,
            port_index: 0,
            retry_count: 0,
            max_retries,
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn port_index(&self) -> usize {
        self.port_index
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Port to try next; `None` when the scheme has no ports configured.
    pub fn port(&self) -> Option<u16> {
        self.ports.get(self.port_index).copied()
    }

    /// Starts a new campaign from the first port of the preferred kind.
    pub fn reset(&mut self) {
        self.kind = self.preferred;
        self.port_index = 0;
        self.retry_count = 0;
    }

    pub fn record_failure(&mut self) -> Advance {
        self.retry_count = self.retry_count.saturating_add(1);
        if self
            .max_retries
            .is_some_and(|max| self.retry_count > max)
        {
            return Advance::Exhausted;
        }
        if self.port_index + 1 < self.ports.len() {
            self.port_index += 1;
            return Advance::NextPort;
        }
        match self.kind {
            TransportKind::Primary => {
                // the retry budget carries over into the fallback pass
                self.kind = TransportKind::Fallback;
                self.port_index = 0;
                Advance::Fallback
            }
            TransportKind::Fallback => Advance::Exhausted,
        }
    }
}
