// Tensors travel as one safetensors blob inside the bincode stream.

use bincode::{
    de::Decoder,
    enc::Encoder,
    error::{DecodeError, EncodeError},
    Decode, Encode,
};
use candle_core::{Device, Tensor, safetensors::BufferedSafetensors};
use safetensors::serialize;

pub fn encode_tensors<E: Encoder>(
    encoder: &mut E,
    tensors: &[(String, &Tensor)],
) -> Result<(), EncodeError> {
    let data = tensors.iter().map(|(name, t)| (name.as_str(), *t));
    let bytes = serialize(data, &None).map_err(|err| EncodeError::OtherString(err.to_string()))?;
    bytes.encode(encoder)
}

pub struct DecodedTensors(BufferedSafetensors);

impl DecodedTensors {
    pub fn decode<C, D: Decoder<Context = C>>(decoder: &mut D) -> Result<Self, DecodeError> {
        let bytes: Vec<u8> = Vec::decode(decoder)?;
        let buffered = BufferedSafetensors::new(bytes)
            .map_err(|err| DecodeError::OtherString(err.to_string()))?;
        Ok(Self(buffered))
    }

    /// Tensors are always restored on the host.
    pub fn load(&self, name: &str) -> Result<Tensor, DecodeError> {
        self.0
            .load(name, &Device::Cpu)
            .map_err(|err| DecodeError::OtherString(err.to_string()))
    }
}
