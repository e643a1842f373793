use crate::Result;

/// A fixed set of processes that exchange data through collectives.
///
/// Every collective is blocking: the caller waits until all members have
/// contributed, which makes each call a barrier across the group.
pub trait ProcessGroup: Send + Sync {
    /// This member's rank, in `0..world_size`.
    fn rank(&self) -> usize;

    /// The amount of members in the group.
    fn world_size(&self) -> usize;

    /// Sums `buf` element-wise across all members, writing the result back into `buf`.
    ///
    /// # Errors
    /// Returns `CommsErr` if a peer is lost, the round times out or the buffer
    /// sizes disagree across members.
    fn all_reduce_sum(&self, buf: &mut [f32]) -> Result<()>;

    /// Waits until every member reaches this point.
    fn barrier(&self) -> Result<()>;

    /// Leaves the group abruptly, waking every member blocked in a collective
    /// with `CommsErr::PeerLost`.
    fn abort(&self);

    /// Averages `buf` element-wise across all members.
    fn all_reduce_mean(&self, buf: &mut [f32]) -> Result<()> {
        self.all_reduce_sum(buf)?;

        let n = self.world_size() as f32;
        for x in buf.iter_mut() {
            *x /= n;
        }

        Ok(())
    }

    /// Whether this member is the group's leader.
    fn is_primary(&self) -> bool {
        self.rank() == 0
    }
}
