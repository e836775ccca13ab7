//! Action sources for the headless play loop.

use anyhow::{bail, Context};
use rand::rngs::StdRng;
use rand::Rng;

use crate::model::frame::{Action, Frame};

/// Produces one action per tick. `None` quits the loop.
pub trait ActionSource {
    fn next_action(&mut self, obs: &Frame, num_actions: usize) -> Option<Action>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScriptStep {
    Act(Action),
    Quit,
}

/// Replays a fixed list, cycling until a `Quit` step. Actions are passed
/// through unchanged; the environment rejects ones outside its range.
#[derive(Clone, Debug)]
pub struct ScriptedActions {
    steps: Vec<ScriptStep>,
    pos: usize,
}

impl ScriptedActions {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self { steps, pos: 0 }
    }

    /// Parse a comma-separated list of action indices, with `q` for quit,
    /// e.g. `"0,3,3,1,q"`.
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let mut steps = Vec::new();
        for item in text.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let step = if item.eq_ignore_ascii_case("q") {
                ScriptStep::Quit
            } else {
                ScriptStep::Act(
                    item.parse()
                        .with_context(|| format!("invalid action '{item}' in script"))?,
                )
            };
            steps.push(step);
        }
        if steps.is_empty() {
            bail!("action script is empty");
        }
        Ok(Self::new(steps))
    }
}

impl ActionSource for ScriptedActions {
    fn next_action(&mut self, _obs: &Frame, _num_actions: usize) -> Option<Action> {
        let step = *self.steps.get(self.pos % self.steps.len().max(1))?;
        self.pos += 1;
        match step {
            ScriptStep::Act(a) => Some(a),
            ScriptStep::Quit => None,
        }
    }
}

/// Uniform random actions from a seeded generator.
#[derive(Clone, Debug)]
pub struct RandomActions {
    rng: StdRng,
}

impl RandomActions {
    pub fn new(rng: StdRng) -> Self {
        Self { rng }
    }
}

impl ActionSource for RandomActions {
    fn next_action(&mut self, _obs: &Frame, num_actions: usize) -> Option<Action> {
        if num_actions == 0 {
            return None;
        }
        Some(self.rng.gen_range(0..num_actions) as Action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn obs() -> Frame {
        Frame::zeros((3, 2, 2))
    }

    #[test]
    fn test_script_cycles() {
        let mut s = ScriptedActions::parse("0, 2,1").unwrap();
        let got: Vec<_> = (0..5).map(|_| s.next_action(&obs(), 4)).collect();
        assert_eq!(got, vec![Some(0), Some(2), Some(1), Some(0), Some(2)]);
    }

    #[test]
    fn test_script_quits() {
        let mut s = ScriptedActions::parse("1,q").unwrap();
        assert_eq!(s.next_action(&obs(), 4), Some(1));
        assert_eq!(s.next_action(&obs(), 4), None);
    }

    #[test]
    fn test_script_passes_out_of_range_actions_through() {
        let mut s = ScriptedActions::parse("9").unwrap();
        assert_eq!(s.next_action(&obs(), 4), Some(9));
    }

    #[test]
    fn test_bad_scripts() {
        assert!(ScriptedActions::parse("").is_err());
        assert!(ScriptedActions::parse("1,x").is_err());
        assert!(ScriptedActions::parse("-1").is_err());
    }

    #[test]
    fn test_random_in_range_and_seeded() {
        let mut a = RandomActions::new(StdRng::seed_from_u64(3));
        let mut b = RandomActions::new(StdRng::seed_from_u64(3));
        for _ in 0..50 {
            let x = a.next_action(&obs(), 5).unwrap();
            assert!(x < 5);
            assert_eq!(Some(x), b.next_action(&obs(), 5));
        }
        assert_eq!(a.next_action(&obs(), 0), None);
    }
}
