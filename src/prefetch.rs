//! Prefetch scheduling by recorded execution order.
//!
//! The first forward pass is a warm-up: the groups it touches, in order,
//! become the recorded order and nothing is prefetched. Later passes look
//! the current group up in that order and return which groups to unshard
//! ahead of need. Backward walks the order in reverse.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// When backward prefetch is issued relative to the current group's work.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackwardPrefetch {
    /// Before the current group's backward compute. More overlap, higher
    /// peak memory.
    BackwardPre,
    /// After the current group's gradient reduce-scatter has been issued.
    BackwardPost,
}

/// Which direction a pass walks the groups in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pass {
    Forward,
    Backward,
}

/// Group order observed during the first full forward pass.
#[derive(Clone, Debug, Default)]
pub struct ExecOrder {
    recorded: Option<Vec<usize>>,
    current: Vec<usize>,
    deviated: bool,
}

impl ExecOrder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a full pass has been recorded.
    pub fn is_warm(&self) -> bool {
        self.recorded.is_some()
    }

    pub fn recorded(&self) -> Option<&[usize]> {
        self.recorded.as_deref()
    }

    /// Note that `group` was entered during the current forward pass.
    ///
    /// Repeat visits within one pass are ignored. Once warm, a visit that
    /// does not match the recorded position is logged once per pass.
    pub fn record(&mut self, group: usize) {
        if self.current.contains(&group) {
            return;
        }
        let position = self.current.len();
        self.current.push(group);
        if let Some(recorded) = &self.recorded {
            if !self.deviated && recorded.get(position) != Some(&group) {
                self.deviated = true;
                warn!(
                    group,
                    position,
                    expected = ?recorded.get(position),
                    "forward order deviates from recorded order; prefetch may be wasted"
                );
            }
        }
    }

    /// Close the current forward pass. The first completed pass becomes the
    /// recorded order; later passes keep it.
    pub fn finish_pass(&mut self) {
        let pass = std::mem::take(&mut self.current);
        self.deviated = false;
        if self.recorded.is_none() && !pass.is_empty() {
            debug!(order = ?pass, "execution order recorded");
            self.recorded = Some(pass);
        }
    }

    /// Drop the current pass without recording it.
    pub fn abandon_pass(&mut self) {
        self.current.clear();
        self.deviated = false;
    }

    /// Up to `depth` groups that follow `group` in the given direction.
    pub fn next_after(&self, group: usize, pass: Pass, depth: usize) -> Vec<usize> {
        let Some(order) = &self.recorded else {
            return Vec::new();
        };
        let Some(pos) = order.iter().position(|&g| g == group) else {
            return Vec::new();
        };
        match pass {
            Pass::Forward => order[pos + 1..].iter().take(depth).copied().collect(),
            Pass::Backward => order[..pos].iter().rev().take(depth).copied().collect(),
        }
    }

    /// First group a pass will touch, when known.
    pub fn first(&self, pass: Pass) -> Option<usize> {
        let order = self.recorded.as_ref()?;
        match pass {
            Pass::Forward => order.first().copied(),
            Pass::Backward => order.last().copied(),
        }
    }
}

/// Prefetch knobs plus the recorded order they act on.
#[derive(Clone, Debug)]
pub struct Prefetcher {
    order: ExecOrder,
    backward: Option<BackwardPrefetch>,
    forward: bool,
    depth: usize,
}

impl Prefetcher {
    pub fn new(backward: Option<BackwardPrefetch>, forward: bool, depth: usize) -> Self {
        Self {
            order: ExecOrder::new(),
            backward,
            forward,
            depth: depth.max(1),
        }
    }

    pub fn order(&self) -> &ExecOrder {
        &self.order
    }

    pub fn order_mut(&mut self) -> &mut ExecOrder {
        &mut self.order
    }

    pub fn backward_mode(&self) -> Option<BackwardPrefetch> {
        self.backward
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Groups to unshard on entering `group` during a forward pass.
    pub fn forward_targets(&self, group: usize) -> Vec<usize> {
        if !self.forward {
            return Vec::new();
        }
        self.order.next_after(group, Pass::Forward, self.depth)
    }

    /// Groups to unshard around `group`'s backward at the given point.
    pub fn backward_targets(&self, group: usize, at: BackwardPrefetch) -> Vec<usize> {
        if self.backward != Some(at) {
            return Vec::new();
        }
        self.order.next_after(group, Pass::Backward, self.depth)
    }
}
