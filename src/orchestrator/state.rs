use crate::core::{ProvisionError, ProvisionResult, Stage, Tier};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Init,
    Resolving(Tier),
    Fetching(Tier),
    Installing(Tier),
    Verifying(Tier),
    Done,
    Failed { tier: Tier, stage: Stage },
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Failed { .. })
    }

    /// The tier and stage being worked on, if any.
    pub fn active(&self) -> Option<(Tier, Stage)> {
        match *self {
            RunState::Resolving(t) => Some((t, Stage::Resolving)),
            RunState::Fetching(t) => Some((t, Stage::Fetching)),
            RunState::Installing(t) => Some((t, Stage::Installing)),
            RunState::Verifying(t) => Some((t, Stage::Verifying)),
            _ => None,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Init => f.write_str("INIT"),
            RunState::Resolving(t) => write!(f, "RESOLVING({})", t),
            RunState::Fetching(t) => write!(f, "FETCHING({})", t),
            RunState::Installing(t) => write!(f, "INSTALLING({})", t),
            RunState::Verifying(t) => write!(f, "VERIFYING({})", t),
            RunState::Done => f.write_str("DONE"),
            RunState::Failed { tier, stage } => write!(f, "FAILED({}, {})", tier, stage),
        }
    }
}

/// One end-to-end run over the selected tiers.
///
/// Only legal transitions are accepted:
/// `INIT -> RESOLVING(t) -> FETCHING(t) -> INSTALLING(t) -> VERIFYING(t)`,
/// then the next tier's `RESOLVING` or `DONE`. Any active state may move to
/// `FAILED`, or skip ahead to the next tier when the tier is optional.
#[derive(Debug, Clone)]
pub struct ProvisioningRun {
    run_id: String,
    tiers: Vec<Tier>,
    state: RunState,
    history: Vec<RunState>,
    /// Last tier that passed verification
    checkpoint: Option<Tier>,
}

impl ProvisioningRun {
    /// `tiers` are sorted into tier order and deduplicated.
    pub fn new(run_id: impl Into<String>, mut tiers: Vec<Tier>) -> Self {
        tiers.sort();
        tiers.dedup();
        Self {
            run_id: run_id.into(),
            tiers,
            state: RunState::Init,
            history: vec![RunState::Init],
            checkpoint: None,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn tiers(&self) -> &[Tier] {
        &self.tiers
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn history(&self) -> &[RunState] {
        &self.history
    }

    pub fn checkpoint(&self) -> Option<Tier> {
        self.checkpoint
    }

    fn next_tier(&self, tier: Tier) -> Option<Tier> {
        self.tiers.iter().copied().find(|t| *t > tier)
    }

    fn set(&mut self, next: RunState) -> RunState {
        self.state = next;
        self.history.push(next);
        next
    }

    fn illegal(&self, action: &str) -> ProvisionError {
        ProvisionError::Config(format!(
            "run {}: cannot {} from state {}",
            self.run_id, action, self.state
        ))
    }

    /// INIT to the first tier's RESOLVING, or straight to DONE without tiers.
    pub fn start(&mut self) -> ProvisionResult<RunState> {
        if self.state != RunState::Init {
            return Err(self.illegal("start"));
        }
        Ok(match self.tiers.first() {
            Some(first) => self.set(RunState::Resolving(*first)),
            None => self.set(RunState::Done),
        })
    }

    /// Next stage of the current tier; after VERIFYING the tier is
    /// checkpointed and the run moves to the next tier or DONE.
    pub fn advance(&mut self) -> ProvisionResult<RunState> {
        let next = match self.state {
            RunState::Resolving(t) => RunState::Fetching(t),
            RunState::Fetching(t) => RunState::Installing(t),
            RunState::Installing(t) => RunState::Verifying(t),
            RunState::Verifying(t) => {
                self.checkpoint = Some(t);
                match self.next_tier(t) {
                    Some(n) => RunState::Resolving(n),
                    None => RunState::Done,
                }
            }
            _ => return Err(self.illegal("advance")),
        };
        Ok(self.set(next))
    }

    /// Leave the current tier without completing it (optional tier failure,
    /// or a dry run that stops after resolution).
    pub fn skip_tier(&mut self) -> ProvisionResult<RunState> {
        let (tier, _) = self.state.active().ok_or_else(|| self.illegal("skip a tier"))?;
        let next = match self.next_tier(tier) {
            Some(n) => RunState::Resolving(n),
            None => RunState::Done,
        };
        Ok(self.set(next))
    }

    /// Fail the run in the current tier and stage.
    pub fn fail(&mut self) -> ProvisionResult<RunState> {
        let (tier, stage) = self.state.active().ok_or_else(|| self.illegal("fail"))?;
        Ok(self.set(RunState::Failed { tier, stage }))
    }
}
