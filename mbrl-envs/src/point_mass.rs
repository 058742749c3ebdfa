use anyhow::Result;
use mbrl_core::{
    env::{Env, EnvironmentDescription, SnapShot, Space},
    path::Path,
    rng::seeded,
};
use rand::Rng;

const DT: f32 = 0.1;
const HORIZON: usize = 25;
const ACTION_COST: f32 = 0.01;
const SUCCESS_RADIUS: f32 = 0.1;

/// A unit mass driven by a bounded force towards the origin. The state is the position followed
/// by the velocity, `2 * dim` entries in total.
#[derive(Debug, Clone)]
pub struct PointMass {
    dim: usize,
    name: &'static str,
    state: Vec<f32>,
    steps: usize,
}

impl PointMass {
    pub fn new(dim: usize) -> Self {
        let name = if dim == 1 { "point_mass_1d" } else { "point_mass" };
        Self {
            dim,
            name,
            state: vec![0.; 2 * dim],
            steps: 0,
        }
    }

    fn clip(action: &[f32]) -> Vec<f32> {
        action.iter().map(|a| a.clamp(-1., 1.)).collect()
    }

    fn transition(&self, state: &[f32], action: &[f32]) -> Vec<f32> {
        let (pos, vel) = state.split_at(self.dim);
        let new_vel: Vec<f32> = vel.iter().zip(action).map(|(v, a)| v + DT * a).collect();
        let new_pos = pos.iter().zip(&new_vel).map(|(p, v)| p + DT * v);
        new_pos.chain(new_vel.iter().copied()).collect()
    }

    fn distance(&self, state: &[f32]) -> f32 {
        state[..self.dim].iter().map(|p| p * p).sum::<f32>().sqrt()
    }

    fn reward_for(&self, action: &[f32], next_state: &[f32]) -> f32 {
        let effort: f32 = Self::clip(action).iter().map(|a| a * a).sum();
        -self.distance(next_state) - ACTION_COST * effort
    }
}

impl Env for PointMass {
    fn name(&self) -> &str {
        self.name
    }

    fn reset(&mut self, seed: u64) -> Result<Vec<f32>> {
        let mut rng = seeded(seed);
        self.state = (0..self.dim)
            .map(|_| rng.random_range(-1f32..1.))
            .chain(std::iter::repeat_n(0., self.dim))
            .collect();
        self.steps = 0;
        Ok(self.state.clone())
    }

    fn step(&mut self, action: &[f32]) -> Result<SnapShot> {
        let action = Self::clip(action);
        let next_state = self.transition(&self.state, &action);
        let reward = self.reward_for(&action, &next_state);
        self.state = next_state;
        self.steps += 1;
        Ok(SnapShot {
            state: self.state.clone(),
            reward,
            terminated: false,
            truncated: self.steps >= HORIZON,
        })
    }

    fn env_description(&self) -> EnvironmentDescription {
        EnvironmentDescription::new(
            Space::continous_from_dims(vec![2 * self.dim]),
            Space::bounded(vec![-1.; self.dim], vec![1.; self.dim]),
        )
    }

    fn horizon(&self) -> usize {
        HORIZON
    }

    fn reward(&self, _state: &[f32], action: &[f32], next_state: &[f32]) -> Option<f32> {
        Some(self.reward_for(action, next_state))
    }

    /// A path succeeds when it ends within `0.1` of the origin.
    fn path_success(&self, path: &Path) -> Option<bool> {
        Some(self.distance(path.last_observation()) < SUCCESS_RADIUS)
    }

    /// Percentage of successful paths.
    fn evaluate_success(&self, paths: &[Path]) -> Result<Option<f32>> {
        if paths.is_empty() {
            return Ok(None);
        }
        let successes = paths
            .iter()
            .filter(|p| p.success.or_else(|| self.path_success(p)) == Some(true))
            .count();
        Ok(Some(100. * successes as f32 / paths.len() as f32))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn episode_is_truncated_at_horizon() -> Result<()> {
        let mut env = PointMass::new(1);
        let state = env.reset(3)?;
        assert_eq!(state.len(), 2);
        assert_eq!(state[1], 0.);
        let mut steps = 0;
        loop {
            let snapshot = env.step(&[0.5])?;
            steps += 1;
            assert!(!snapshot.terminated);
            if snapshot.truncated {
                break;
            }
        }
        assert_eq!(steps, 25);
        Ok(())
    }

    #[test]
    fn analytic_reward_matches_step_reward() -> Result<()> {
        let mut env = PointMass::new(2);
        let state = env.reset(8)?;
        let action = [2.0, -0.3];
        let snapshot = env.step(&action)?;
        let reward = env.reward(&state, &action, &snapshot.state);
        assert_eq!(reward, Some(snapshot.reward));
        // force is clipped to the unit box
        assert!((snapshot.state[2] - 0.1).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn success_counts_paths_near_origin() -> Result<()> {
        let env = PointMass::new(1);
        let mut near = Path::new(vec![0.5, 0.]);
        near.push_step(vec![0.], vec![0.], 0., vec![0.05, 0.]);
        let mut far = Path::new(vec![0.5, 0.]);
        far.push_step(vec![0.], vec![0.], 0., vec![0.5, 0.]);
        assert_eq!(env.path_success(&near), Some(true));
        assert_eq!(env.path_success(&far), Some(false));
        assert_eq!(env.evaluate_success(&[near, far])?, Some(50.));
        assert_eq!(env.evaluate_success(&[])?, None);
        Ok(())
    }
}
