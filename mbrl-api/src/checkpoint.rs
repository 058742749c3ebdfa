use anyhow::{Context, Result};
use bincode::{Decode, Encode};
use candle_core::Device;
use mbrl_agents::npg::Npg;
use mbrl_core::{policies::GaussianMlp, replay_buffer::ReplayBuffer};
use std::{
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

pub fn agent_file(dir: &Path, tag: &str) -> PathBuf {
    dir.join(format!("agent_{tag}.bin"))
}

pub fn policy_file(dir: &Path, tag: &str) -> PathBuf {
    dir.join(format!("policy_{tag}.bin"))
}

fn write_values(path: &Path, write: impl FnOnce(&mut BufWriter<File>) -> Result<()>) -> Result<()> {
    let mut writer = BufWriter::new(
        File::create(path).with_context(|| format!("creating checkpoint {}", path.display()))?,
    );
    write(&mut writer)?;
    writer.flush()?;
    Ok(())
}

fn encode_into<T: Encode>(value: &T, writer: &mut BufWriter<File>) -> Result<()> {
    bincode::encode_into_std_write(value, writer, bincode::config::standard())?;
    Ok(())
}

fn decode_from<T: Decode<()>>(reader: &mut BufReader<File>) -> Result<T> {
    Ok(bincode::decode_from_std_read(
        reader,
        bincode::config::standard(),
    )?)
}

/// Writes `agent_<tag>.bin` (agent and replay buffer) and `policy_<tag>.bin`. Tensors are moved
/// to the host for serialization and back to the agent's device afterwards.
pub fn save_checkpoint(dir: &Path, tag: &str, agent: &mut Npg, buffer: &ReplayBuffer) -> Result<()> {
    let device = agent.device().clone();
    if !device.is_cpu() {
        agent.relocate(&Device::Cpu)?;
    }
    let written = write_values(&agent_file(dir, tag), |writer| {
        encode_into(&*agent, writer)?;
        encode_into(buffer, writer)
    })
    .and_then(|_| write_values(&policy_file(dir, tag), |writer| encode_into(&agent.policy, writer)));
    if !device.is_cpu() {
        agent.relocate(&device)?;
    }
    written?;
    tracing::info!(tag, dir = %dir.display(), "saved checkpoint");
    Ok(())
}

fn open(path: &Path) -> Result<BufReader<File>> {
    Ok(BufReader::new(File::open(path).with_context(|| {
        format!("opening checkpoint {}", path.display())
    })?))
}

pub fn load_agent(path: &Path, device: &Device) -> Result<(Npg, ReplayBuffer)> {
    let mut reader = open(path)?;
    let mut agent: Npg = decode_from(&mut reader)?;
    let buffer: ReplayBuffer = decode_from(&mut reader)?;
    if !device.is_cpu() {
        agent.relocate(device)?;
    }
    Ok((agent, buffer))
}

pub fn load_policy(path: &Path, device: &Device) -> Result<GaussianMlp> {
    let mut policy: GaussianMlp = decode_from(&mut open(path)?)?;
    if !device.is_cpu() {
        policy.relocate(device)?;
    }
    Ok(policy)
}
