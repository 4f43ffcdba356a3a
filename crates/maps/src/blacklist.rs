/// A blocked source. The row self-expires: the classifier deletes it lazily
/// on the first packet past the deadline and the reaper sweeps the rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlacklistEntry {
    pub blocked_until_ms: u64,
}
