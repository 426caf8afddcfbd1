/// Static configuration for a coordination node.
///
/// Two things are configured:
///
/// - **Topology**: the fixed list of servers, loaded from a whitespace
///   separated file (`serverId address clientPort coordinationPort` per line).
///   One entry is this process, the rest become neighbours.
/// - **Timing**: every protocol wait is bounded, and all bounds live in
///   [`ClusterConfig`].
use crate::error::{MeshError, MeshResult};
use crate::types::ServerDescriptor;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Timeouts and retry bounds for the coordination protocols.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Interval between heartbeat rounds (default: 60 seconds).
    pub heartbeat_interval: Duration,
    /// Wait for a `heartbeatresponse` (default: 10 seconds).
    pub probe_timeout: Duration,
    /// Wait for an `answer` after sending `election` (default: 10 seconds).
    pub answer_timeout: Duration,
    /// Wait for a `coordinator` after sending `nomination` (default: 10 seconds).
    pub nomination_timeout: Duration,
    /// Minimum time an election participant waits for a nomination or
    /// coordinator announcement after answering (default: 10 seconds).
    /// See [`ClusterConfig::nomination_window`].
    pub coordinator_wait: Duration,
    /// Wait for `view` replies during recovery (default: 2 seconds).
    pub recovery_window: Duration,
    /// Deadline for a whole broadcast fan-out (default: 10 seconds).
    pub broadcast_deadline: Duration,
    /// Round-trip bound for requests sent to the leader (default: 10 seconds).
    pub request_timeout: Duration,
    /// Bound on opening a TCP connection (default: 5 seconds).
    pub connect_timeout: Duration,
    /// Election rounds attempted before giving up until the next
    /// heartbeat (default: 5).
    pub max_election_rounds: usize,
    /// Re-election retries when the leader cannot be contacted (default: 1).
    pub leader_retries: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(10),
            answer_timeout: Duration::from_secs(10),
            nomination_timeout: Duration::from_secs(10),
            coordinator_wait: Duration::from_secs(10),
            recovery_window: Duration::from_secs(2),
            broadcast_deadline: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            max_election_rounds: 5,
            leader_retries: 1,
        }
    }
}

impl ClusterConfig {
    /// Create a config with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the heartbeat interval.
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Use one bound for every peer wait. Handy for tests and local clusters.
    pub fn peer_timeouts(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self.answer_timeout = timeout;
        self.nomination_timeout = timeout;
        self.coordinator_wait = timeout;
        self.broadcast_deadline = timeout;
        self.request_timeout = timeout;
        self.connect_timeout = timeout;
        self
    }

    /// Set the recovery window.
    pub fn recovery_window(mut self, window: Duration) -> Self {
        self.recovery_window = window;
        self
    }

    /// Set the maximum number of election rounds.
    pub fn max_election_rounds(mut self, rounds: usize) -> Self {
        self.max_election_rounds = rounds.max(1);
        self
    }

    /// How long an election participant keeps its connection open after
    /// answering.
    ///
    /// The initiator collects answers, then nominates responders one by one,
    /// highest first. A participant with `candidates_ahead` higher-priority
    /// servers may be nominated only after each of them timed out, so the
    /// wait covers the answer phase plus one nomination timeout per
    /// candidate ahead of it and its own. Never shorter than
    /// `coordinator_wait`.
    pub fn nomination_window(&self, candidates_ahead: usize) -> Duration {
        let slots = u32::try_from(candidates_ahead.saturating_add(1)).unwrap_or(u32::MAX);
        let worst_case = self
            .answer_timeout
            .saturating_add(self.nomination_timeout.saturating_mul(slots));
        worst_case.max(self.coordinator_wait)
    }
}

/// One line of the static server list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEntry {
    pub server_id: String,
    pub address: String,
    pub client_port: u16,
    pub coordination_port: u16,
}

impl ServerEntry {
    /// Parse a single whitespace separated configuration line.
    pub fn parse_line(line: &str, line_no: usize) -> MeshResult<Self> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 4 {
            return Err(MeshError::Config(format!(
                "line {}: expected 4 fields, found {}",
                line_no,
                fields.len()
            )));
        }

        let port = |raw: &str, what: &str| -> MeshResult<u16> {
            raw.parse().map_err(|_| {
                MeshError::Config(format!("line {}: invalid {} '{}'", line_no, what, raw))
            })
        };

        Ok(Self {
            server_id: fields[0].to_string(),
            address: fields[1].to_string(),
            client_port: port(fields[2], "client port")?,
            coordination_port: port(fields[3], "coordination port")?,
        })
    }
}

/// Parse a full server list. Blank lines and `#` comments are skipped.
pub fn parse_servers(contents: &str) -> MeshResult<Vec<ServerEntry>> {
    contents
        .lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
        .map(|(line_no, line)| ServerEntry::parse_line(line, line_no))
        .collect()
}

/// This process's descriptor plus every neighbour, keyed by server id.
#[derive(Debug, Clone)]
pub struct Topology {
    pub current: ServerDescriptor,
    pub neighbours: HashMap<String, ServerDescriptor>,
}

impl Topology {
    /// Split a server list into self and neighbours.
    ///
    /// Rejects a missing self entry, duplicate ids and duplicate priorities;
    /// the election has no tie-break so equal priorities are refused here.
    pub fn from_entries(entries: Vec<ServerEntry>, self_id: &str) -> MeshResult<Self> {
        let mut seen_ids = HashSet::new();
        let mut seen_priorities = HashMap::new();
        let mut current = None;
        let mut neighbours = HashMap::new();

        for entry in entries {
            let descriptor = ServerDescriptor::new(
                entry.server_id,
                entry.address,
                entry.client_port,
                entry.coordination_port,
            )?;

            if !seen_ids.insert(descriptor.server_id.clone()) {
                return Err(MeshError::Config(format!(
                    "duplicate server id '{}'",
                    descriptor.server_id
                )));
            }
            if let Some(other) =
                seen_priorities.insert(descriptor.priority, descriptor.server_id.clone())
            {
                return Err(MeshError::Config(format!(
                    "servers '{}' and '{}' share priority {}",
                    other, descriptor.server_id, descriptor.priority
                )));
            }

            if descriptor.server_id == self_id {
                current = Some(descriptor);
            } else {
                neighbours.insert(descriptor.server_id.clone(), descriptor);
            }
        }

        let current = current.ok_or_else(|| {
            MeshError::Config(format!("no entry for server '{}' in configuration", self_id))
        })?;

        Ok(Self {
            current,
            neighbours,
        })
    }

    /// Read and parse a configuration file.
    pub fn load(path: impl AsRef<Path>, self_id: &str) -> MeshResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            MeshError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_entries(parse_servers(&contents)?, self_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = "\
# id   address    client coordination
s1 localhost 4444 5555
s2 localhost 4445 5556

s3 10.0.0.3 4446 5557
";

    #[test]
    fn test_config_defaults() {
        let config = ClusterConfig::default();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(60));
        assert_eq!(config.leader_retries, 1);
        assert!(config.max_election_rounds >= 1);
    }

    #[test]
    fn test_config_builder() {
        let config = ClusterConfig::new()
            .heartbeat_interval(Duration::from_millis(200))
            .peer_timeouts(Duration::from_millis(50))
            .max_election_rounds(0);
        assert_eq!(config.heartbeat_interval, Duration::from_millis(200));
        assert_eq!(config.answer_timeout, Duration::from_millis(50));
        assert_eq!(config.request_timeout, Duration::from_millis(50));
        assert_eq!(config.max_election_rounds, 1);
    }

    #[test]
    fn test_nomination_window_covers_candidates_ahead() {
        let config = ClusterConfig::new().peer_timeouts(Duration::from_millis(200));
        assert_eq!(config.nomination_window(0), Duration::from_millis(400));
        assert_eq!(config.nomination_window(2), Duration::from_millis(800));

        let patient = ClusterConfig {
            coordinator_wait: Duration::from_secs(30),
            ..ClusterConfig::default()
        };
        assert_eq!(patient.nomination_window(0), Duration::from_secs(30));
        assert_eq!(patient.nomination_window(3), Duration::from_secs(50));
    }

    #[test]
    fn test_parse_servers_skips_comments() {
        let entries = parse_servers(SAMPLE).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].address, "10.0.0.3");
        assert_eq!(entries[2].coordination_port, 5557);
    }

    #[test]
    fn test_parse_line_errors_name_the_line() {
        let err = parse_servers("s1 localhost 4444\n").unwrap_err();
        assert!(err.to_string().contains("line 1"));

        let err = parse_servers("s1 localhost 4444 port\n").unwrap_err();
        assert!(err.to_string().contains("coordination port"));
    }

    #[test]
    fn test_topology_split() {
        let topology = Topology::from_entries(parse_servers(SAMPLE).unwrap(), "s2").unwrap();
        assert_eq!(topology.current.server_id, "s2");
        assert_eq!(topology.current.priority, 2);
        assert_eq!(topology.neighbours.len(), 2);
        assert!(topology.neighbours.contains_key("s1"));
        assert!(topology.neighbours.contains_key("s3"));
    }

    #[test]
    fn test_topology_requires_self() {
        let err = Topology::from_entries(parse_servers(SAMPLE).unwrap(), "s9").unwrap_err();
        assert!(matches!(err, MeshError::Config(_)));
    }

    #[test]
    fn test_topology_rejects_duplicate_priority() {
        let entries = parse_servers("s1 localhost 1 2\nnode1 localhost 3 4\n").unwrap();
        let err = Topology::from_entries(entries, "s1").unwrap_err();
        assert!(err.to_string().contains("share priority"));
    }

    #[test]
    fn test_topology_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let topology = Topology::load(file.path(), "s1").unwrap();
        assert_eq!(topology.current.coordination_port, 5555);

        let missing = Topology::load("/nonexistent/servers.conf", "s1");
        assert!(matches!(missing, Err(MeshError::Config(_))));
    }
}
