/// Per-connection diagnostic counters. Every dropped or rejected segment is counted here,
///  whether or not it caused a reply.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ConnectionStats {
    pub packets_in: u64,
    pub bytes_in: u64,
    pub packets_out: u64,
    pub bytes_out: u64,

    pub malformed: u64,
    pub checksum_mismatch: u64,
    pub out_of_window: u64,
    pub unexpected_type: u64,
    pub service_code_mismatch: u64,
    pub negotiation_failed: u64,
    pub resource_exhausted: u64,

    pub resets_sent: u64,
    pub connection_attempts: u64,
    /// number of times the connection reached Established
    pub connects: u64,
}
