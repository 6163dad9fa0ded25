//! In-process collective for worker threads.
//!
//! One [`Membership`] per worker. Per epoch:
//!
//! ```text
//! barrier()                      all live members line up
//! all_reduce_mean(grads)  x n    one round per local batch
//! join(buf) until None           shadow the rounds of members with more batches
//! leave()                        end of the stepping phase
//! ```
//!
//! Every stepping member takes part in every round. A member that ran out of
//! batches joins with no contribution and receives the same mean as the
//! others, so all replicas apply identical updates. The phase ends with the
//! first round that nobody contributes to, which every member observes.
//! Dropping a membership leaves the group for good, which also releases peers
//! blocked in a barrier or reduction when a worker fails.

use crate::{Error, Result};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct GroupState {
    /// Live members.
    members: usize,
    /// Members that passed the last barrier and have not left since.
    stepping: usize,
    barrier_arrived: usize,
    barrier_generation: u64,
    reduce_arrived: usize,
    /// Arrivals of the current round that brought values.
    reduce_active: usize,
    reduce_generation: u64,
    sums: Vec<Vec<f32>>,
    result: Arc<Vec<Vec<f32>>>,
    contributors: usize,
    failure: Option<String>,
}

impl GroupState {
    fn finish_barrier(&mut self) {
        self.barrier_arrived = 0;
        self.barrier_generation += 1;
        self.stepping = self.members;
    }

    #[allow(clippy::cast_precision_loss)]
    fn finish_reduce(&mut self) {
        let mut sums = std::mem::take(&mut self.sums);
        if self.reduce_active > 0 {
            let n = self.reduce_active as f32;
            for value in sums.iter_mut().flatten() {
                *value /= n;
            }
        }
        self.result = Arc::new(sums);
        self.contributors = self.reduce_active;
        self.reduce_arrived = 0;
        self.reduce_active = 0;
        self.reduce_generation += 1;
    }
}

/// A fixed-size group of in-process workers.
#[derive(Debug)]
pub struct LocalGroup {
    state: Mutex<GroupState>,
    changed: Condvar,
}

impl LocalGroup {
    pub fn new(size: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(GroupState {
                members: size,
                ..GroupState::default()
            }),
            changed: Condvar::new(),
        })
    }

    /// Membership handle for worker `rank`; each rank takes exactly one.
    pub fn member(self: &Arc<Self>, rank: usize) -> Membership {
        Membership {
            group: Arc::clone(self),
            rank,
            stepping: false,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, GroupState>> {
        self.state
            .lock()
            .map_err(|_| Error::Collective("group state lock poisoned".into()))
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, GroupState>) -> Result<MutexGuard<'a, GroupState>> {
        self.changed
            .wait(guard)
            .map_err(|_| Error::Collective("group state lock poisoned".into()))
    }
}

/// One worker's seat in a [`LocalGroup`].
#[derive(Debug)]
pub struct Membership {
    group: Arc<LocalGroup>,
    rank: usize,
    stepping: bool,
}

impl Membership {
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Wait until every live member has arrived; afterwards all of them step.
    pub fn barrier(&mut self) -> Result<()> {
        self.leave()?;
        let group = Arc::clone(&self.group);
        let mut state = group.lock()?;
        let generation = state.barrier_generation;
        state.barrier_arrived += 1;
        if state.barrier_arrived >= state.members {
            state.finish_barrier();
            group.changed.notify_all();
        } else {
            while state.barrier_generation == generation {
                state = group.wait(state)?;
            }
        }
        self.stepping = true;
        Ok(())
    }

    /// Average `values` element-wise over the members contributing to this
    /// round.
    ///
    /// On return `values` holds the mean; the result is the number of members
    /// that contributed.
    pub fn all_reduce_mean(&mut self, values: &mut [Vec<f32>]) -> Result<usize> {
        self.round(values, true)
    }

    /// Take part in a round without contributing.
    ///
    /// Returns `None` once no member contributes any more, which ends the
    /// stepping phase for everyone. Otherwise `values` is overwritten with the
    /// mean of the contributors, exactly as they received it.
    pub fn join(&mut self, values: &mut [Vec<f32>]) -> Result<Option<usize>> {
        let contributors = self.round(values, false)?;
        Ok((contributors > 0).then_some(contributors))
    }

    fn round(&mut self, values: &mut [Vec<f32>], contribute: bool) -> Result<usize> {
        if !self.stepping {
            return Err(Error::Collective(format!(
                "rank {} reduced outside a stepping phase",
                self.rank
            )));
        }
        let group = Arc::clone(&self.group);
        let mut state = group.lock()?;
        if let Some(failure) = &state.failure {
            return Err(Error::Collective(failure.clone()));
        }

        if contribute {
            if state.reduce_active == 0 {
                state.sums = values.to_vec();
            } else {
                if !same_shape(&state.sums, values) {
                    let message =
                        format!("rank {} contributed tensors of a different shape", self.rank);
                    state.failure = Some(message.clone());
                    group.changed.notify_all();
                    return Err(Error::Collective(message));
                }
                for (sum, value) in state.sums.iter_mut().zip(values.iter()) {
                    for (s, v) in sum.iter_mut().zip(value) {
                        *s += v;
                    }
                }
            }
            state.reduce_active += 1;
        }

        state.reduce_arrived += 1;
        let generation = state.reduce_generation;
        if state.reduce_arrived >= state.stepping {
            state.finish_reduce();
            group.changed.notify_all();
        } else {
            while state.reduce_generation == generation {
                if let Some(failure) = &state.failure {
                    return Err(Error::Collective(failure.clone()));
                }
                state = group.wait(state)?;
            }
        }

        if state.contributors > 0 {
            if !same_shape(&state.result, values) {
                return Err(Error::Collective(format!(
                    "rank {} expects tensors of a different shape",
                    self.rank
                )));
            }
            for (out, mean) in values.iter_mut().zip(state.result.iter()) {
                out.copy_from_slice(mean);
            }
        }
        Ok(state.contributors)
    }

    /// Stop taking part in reductions until the next barrier.
    pub fn leave(&mut self) -> Result<()> {
        if !self.stepping {
            return Ok(());
        }
        self.stepping = false;
        let mut state = self.group.lock()?;
        state.stepping = state.stepping.saturating_sub(1);
        if state.reduce_arrived > 0 && state.reduce_arrived >= state.stepping {
            state.finish_reduce();
        }
        self.group.changed.notify_all();
        Ok(())
    }

    fn depart(&mut self) -> Result<()> {
        self.leave()?;
        let mut state = self.group.lock()?;
        state.members = state.members.saturating_sub(1);
        if state.barrier_arrived > 0 && state.barrier_arrived >= state.members {
            state.finish_barrier();
        }
        self.group.changed.notify_all();
        Ok(())
    }
}

fn same_shape(a: &[Vec<f32>], b: &[Vec<f32>]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.len() == y.len())
}

impl Drop for Membership {
    fn drop(&mut self) {
        if let Err(e) = self.depart() {
            tracing::error!(rank = self.rank, error = %e, "failed to leave worker group");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_mean_over_all_members() {
        let group = LocalGroup::new(3);
        let results: Vec<(usize, Vec<f32>)> = thread::scope(|s| {
            let handles: Vec<_> = (0..3)
                .map(|rank| {
                    let mut member = group.member(rank);
                    s.spawn(move || {
                        member.barrier().unwrap();
                        let mut grads = vec![vec![rank as f32, 1.0], vec![3.0 * rank as f32]];
                        let n = member.all_reduce_mean(&mut grads).unwrap();
                        (n, grads.concat())
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        for (n, grads) in results {
            assert_eq!(n, 3);
            assert_eq!(grads, vec![1.0, 1.0, 3.0]);
        }
    }

    #[test]
    fn test_uneven_steps_do_not_deadlock() {
        let group = LocalGroup::new(2);
        let steps = [4usize, 1];
        let counts: Vec<Vec<usize>> = thread::scope(|s| {
            let handles: Vec<_> = (0..2)
                .map(|rank| {
                    let mut member = group.member(rank);
                    s.spawn(move || {
                        let mut seen = Vec::new();
                        for _epoch in 0..2 {
                            member.barrier().unwrap();
                            for _ in 0..steps[rank] {
                                let mut grads = vec![vec![1.0; 4]];
                                seen.push(member.all_reduce_mean(&mut grads).unwrap());
                            }
                            member.leave().unwrap();
                        }
                        seen
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(counts[1], vec![2, 2]);
        assert_eq!(counts[0].len(), 8);
        // each epoch: the first round has both contributors, later rounds only rank 0
        assert_eq!(counts[0].iter().filter(|&&n| n == 2).count(), 2);
        assert!(counts[0].iter().all(|&n| n == 1 || n == 2));
    }

    #[test]
    fn test_joined_member_sees_the_same_means() {
        let group = LocalGroup::new(2);
        let steps = [3usize, 1];
        let seen: Vec<Vec<Vec<f32>>> = thread::scope(|s| {
            let handles: Vec<_> = (0..2)
                .map(|rank| {
                    let mut member = group.member(rank);
                    s.spawn(move || {
                        let mut means = Vec::new();
                        member.barrier().unwrap();
                        for step in 0..steps[rank] {
                            let mut grads = vec![vec![(rank + step) as f32; 2]];
                            member.all_reduce_mean(&mut grads).unwrap();
                            means.push(grads.concat());
                        }
                        loop {
                            let mut grads = vec![vec![0.0; 2]];
                            match member.join(&mut grads).unwrap() {
                                Some(_) => means.push(grads.concat()),
                                None => break,
                            }
                        }
                        member.leave().unwrap();
                        means
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        // first round averages 0 and 1, then rank 0 contributes alone
        let expected = vec![vec![0.5, 0.5], vec![1.0, 1.0], vec![2.0, 2.0]];
        assert_eq!(seen[0], expected);
        assert_eq!(seen[1], expected);
    }

    #[test]
    fn test_phase_without_contributions_ends_at_once() {
        let group = LocalGroup::new(2);
        let ended: Vec<Option<usize>> = thread::scope(|s| {
            let handles: Vec<_> = (0..2)
                .map(|rank| {
                    let mut member = group.member(rank);
                    s.spawn(move || {
                        member.barrier().unwrap();
                        member.join(&mut [vec![0.0]]).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(ended, vec![None, None]);
    }

    #[test]
    fn test_dropped_member_releases_barrier() {
        let group = LocalGroup::new(2);
        thread::scope(|s| {
            let mut survivor = group.member(0);
            let failed = group.member(1);
            let waiter = s.spawn(move || {
                survivor.barrier().unwrap();
                let mut grads = vec![vec![2.0]];
                survivor.all_reduce_mean(&mut grads).unwrap()
            });
            drop(failed);
            assert_eq!(waiter.join().unwrap(), 1);
        });
    }

    #[test]
    fn test_reduce_requires_barrier() {
        let group = LocalGroup::new(1);
        let mut member = group.member(0);
        assert!(member.all_reduce_mean(&mut [vec![1.0]]).is_err());
        member.barrier().unwrap();
        let mut grads = vec![vec![5.0]];
        assert_eq!(member.all_reduce_mean(&mut grads).unwrap(), 1);
        assert_eq!(grads, vec![vec![5.0]]);
    }
}
