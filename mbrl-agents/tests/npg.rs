use anyhow::Result;
use candle_core::Device;
use mbrl_agents::{
    baseline::{BaselineConfig, QBaseline},
    npg::{Npg, NpgConfig},
};
use mbrl_core::{
    env::Env,
    models::{ModelEnsemble, WorldModelConfig},
    path::TransitionBatch,
    policies::GaussianMlp,
    rng::seeded,
    sampler::sample_data_batch,
    sequential::Activation,
};
use mbrl_envs::PointMass;

fn agent(env: &PointMass, device: &Device) -> Result<Npg> {
    let description = env.env_description();
    let (obs_dim, act_dim) = (description.observation_size(), description.action_size());
    let policy = GaussianMlp::new(obs_dim, act_dim, &[16], Activation::Tanh, -0.5, -2., 0, device)?;
    let baseline_config = BaselineConfig {
        hidden_size: vec![16],
        ..Default::default()
    };
    let baseline = QBaseline::new(obs_dim, act_dim, baseline_config, 0, device)?;
    let model_config = WorldModelConfig {
        hidden_size: vec![32],
        fit_epochs: 5,
        fit_mb_size: 32,
        learn_reward: false,
        ..Default::default()
    };
    let ensemble = ModelEnsemble::new(2, obs_dim, act_dim, model_config, 0, device)?;
    let config = NpgConfig {
        normalized_step_size: 0.01,
        ..Default::default()
    };
    Ok(Npg::new(policy, baseline, ensemble, config))
}

fn fitted_agent(env: &mut PointMass) -> Result<Npg> {
    let device = Device::Cpu;
    let mut agent = agent(env, &device)?;
    let mut rng = seeded(1);
    let paths = sample_data_batch(200, env, &agent.policy, false, 25, &mut rng)?;
    let data = TransitionBatch::from_paths(&paths, 2, 1);
    agent.learned_model.fit(&data, &data, &device, &mut rng)?;
    Ok(agent)
}

#[test]
fn train_step_stays_in_trust_region() -> Result<()> {
    let mut env = PointMass::new(1);
    let mut agent = fitted_agent(&mut env)?;
    let mut rng = seeded(2);
    let init_states: Vec<Vec<f32>> = (0..8).map(|i| vec![i as f32 / 8. - 0.5, 0.]).collect();
    let before = agent.policy.get_param_values()?;
    let stats = agent.train_step(&init_states, 10, &env, &mut rng)?;
    assert!(stats.alpha.is_finite() && stats.alpha > 0.);
    assert!(stats.curvature >= 0.);
    assert!(stats.kl_dist >= 0. && stats.kl_dist < 0.1);
    assert_eq!(stats.num_paths, 8);
    assert!(stats.num_samples <= 80);
    assert_eq!(agent.policy.get_old_param_values()?, before);
    assert_ne!(agent.policy.get_param_values()?, before);
    assert!(agent.running_score().is_some());
    Ok(())
}

#[test]
fn checkpoint_round_trip_preserves_policy() -> Result<()> {
    let mut env = PointMass::new(1);
    let mut agent = fitted_agent(&mut env)?;
    let init_states = vec![vec![0.3, 0.]; 4];
    agent.train_step(&init_states, 5, &env, &mut seeded(3))?;
    let config = bincode::config::standard();
    let bytes = bincode::encode_to_vec(&agent, config)?;
    let (restored, _): (Npg, usize) = bincode::decode_from_slice(&bytes, config)?;
    assert_eq!(restored.policy.get_param_values()?, agent.policy.get_param_values()?);
    assert_eq!(restored.config, agent.config);
    assert_eq!(restored.learned_model.len(), 2);
    assert_eq!(restored.running_score(), agent.running_score());
    Ok(())
}
