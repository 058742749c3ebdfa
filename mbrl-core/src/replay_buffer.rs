use crate::{path::TransitionBatch, rng::sample_indices};
use bincode::{
    Decode, Encode,
    de::Decoder,
    enc::Encoder,
    error::{DecodeError, EncodeError},
};
use rand::rngs::StdRng;
use ringbuffer::{AllocRingBuffer, RingBuffer};
use std::fmt;

/// Fixed capacity circular store of transitions. Once full, new transitions overwrite the oldest
/// ones. A capacity of zero keeps nothing.
pub struct ReplayBuffer {
    capacity: usize,
    obs_dim: usize,
    act_dim: usize,
    states: AllocRingBuffer<Vec<f32>>,
    actions: AllocRingBuffer<Vec<f32>>,
    rewards: AllocRingBuffer<f32>,
    next_states: AllocRingBuffer<Vec<f32>>,
    terminated: AllocRingBuffer<bool>,
}

impl fmt::Debug for ReplayBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplayBuffer")
            .field("capacity", &self.capacity)
            .field("obs_dim", &self.obs_dim)
            .field("act_dim", &self.act_dim)
            .field("len", &self.len())
            .finish()
    }
}

impl ReplayBuffer {
    pub fn new(capacity: usize, obs_dim: usize, act_dim: usize) -> Self {
        // the ring buffers need room for at least one element
        let slots = capacity.max(1);
        Self {
            capacity,
            obs_dim,
            act_dim,
            states: AllocRingBuffer::new(slots),
            actions: AllocRingBuffer::new(slots),
            rewards: AllocRingBuffer::new(slots),
            next_states: AllocRingBuffer::new(slots),
            terminated: AllocRingBuffer::new(slots),
        }
    }

    pub fn len(&self) -> usize {
        self.rewards.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.rewards.is_empty()
    }

    /// Appends the batch in order.
    pub fn store(&mut self, batch: &TransitionBatch) {
        if self.capacity == 0 {
            return;
        }
        // only the newest `capacity` transitions of an oversized batch can survive
        let skip = batch.len().saturating_sub(self.capacity);
        let (o, ac) = (self.obs_dim, self.act_dim);
        for src in skip..batch.len() {
            self.states.enqueue(batch.s[src * o..(src + 1) * o].to_vec());
            self.actions.enqueue(batch.a[src * ac..(src + 1) * ac].to_vec());
            self.rewards.enqueue(batch.r[src]);
            self.next_states
                .enqueue(batch.sp[src * o..(src + 1) * o].to_vec());
            self.terminated.enqueue(batch.terminated[src]);
        }
    }

    /// Every stored transition, oldest first.
    pub fn contents(&self) -> TransitionBatch {
        let mut batch = TransitionBatch::empty(self.obs_dim, self.act_dim);
        let transitions = self
            .states
            .iter()
            .zip(self.actions.iter())
            .zip(self.rewards.iter())
            .zip(self.next_states.iter())
            .zip(self.terminated.iter());
        for ((((s, a), r), sp), terminated) in transitions {
            batch.push(s, a, *r, sp, *terminated);
        }
        batch
    }

    /// `n` states drawn uniformly with replacement.
    pub fn sample_states(&self, n: usize, rng: &mut StdRng) -> Vec<Vec<f32>> {
        if self.is_empty() {
            return vec![];
        }
        sample_indices(rng, self.len(), n)
            .into_iter()
            .filter_map(|idx| self.states.get(idx).cloned())
            .collect()
    }
}

impl Encode for ReplayBuffer {
    fn encode<E: Encoder>(&self, encoder: &mut E) -> Result<(), EncodeError> {
        self.capacity.encode(encoder)?;
        self.obs_dim.encode(encoder)?;
        self.act_dim.encode(encoder)?;
        let contents = self.contents();
        contents.s.encode(encoder)?;
        contents.a.encode(encoder)?;
        contents.r.encode(encoder)?;
        contents.sp.encode(encoder)?;
        contents.terminated.encode(encoder)
    }
}

impl<Ctx> Decode<Ctx> for ReplayBuffer {
    fn decode<D: Decoder<Context = Ctx>>(decoder: &mut D) -> Result<Self, DecodeError> {
        let capacity = usize::decode(decoder)?;
        let obs_dim = usize::decode(decoder)?;
        let act_dim = usize::decode(decoder)?;
        let contents = TransitionBatch {
            obs_dim,
            act_dim,
            s: Vec::decode(decoder)?,
            a: Vec::decode(decoder)?,
            r: Vec::decode(decoder)?,
            sp: Vec::decode(decoder)?,
            terminated: Vec::decode(decoder)?,
        };
        let consistent = contents.s.len() == contents.len() * obs_dim
            && contents.a.len() == contents.len() * act_dim
            && contents.sp.len() == contents.s.len()
            && contents.terminated.len() == contents.len();
        if !consistent {
            return Err(DecodeError::Other("replay buffer fields have inconsistent lengths"));
        }
        let mut buffer = Self::new(capacity, obs_dim, act_dim);
        buffer.store(&contents);
        Ok(buffer)
    }
}
