//! Per-layer decoding state
//!
//! One entry per layer: the slot state carried between calls, the short
//! convolution histories, and the number of tokens seen so far.

use candle_core::Tensor;

use crate::error::{Error, Result};
use crate::ops::SlotState;

/// Convolution histories `[N, D, W]` for the q, k and v projections.
#[derive(Debug, Clone)]
pub struct ConvState {
    pub q: Tensor,
    pub k: Tensor,
    pub v: Tensor,
}

#[derive(Debug, Clone, Default)]
pub struct LayerState {
    pub recurrent_state: Option<SlotState>,
    pub conv_state: Option<ConvState>,
    pub offset: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Cache {
    layers: Vec<LayerState>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn get(&self, layer_idx: usize) -> Option<&LayerState> {
        self.layers.get(layer_idx)
    }

    /// Store the latest states for `layer_idx` and advance its offset.
    ///
    /// Appends when `layer_idx == len()`, replaces an existing entry
    /// otherwise. A `None` state leaves the stored one in place, so a call
    /// made without `use_cache` only advances the offset. Skipping an index
    /// is an error.
    pub fn update(
        &mut self,
        recurrent_state: Option<SlotState>,
        conv_state: Option<ConvState>,
        layer_idx: usize,
        offset: usize,
    ) -> Result<()> {
        let len = self.layers.len();
        if layer_idx > len {
            return Err(Error::CacheLayer { layer_idx, len });
        }
        if layer_idx == len {
            self.layers.push(LayerState {
                recurrent_state,
                conv_state,
                offset,
            });
        } else {
            let entry = &mut self.layers[layer_idx];
            if recurrent_state.is_some() {
                entry.recurrent_state = recurrent_state;
            }
            if conv_state.is_some() {
                entry.conv_state = conv_state;
            }
            entry.offset += offset;
        }
        log::debug!(
            "cache update: layer={} offset={}",
            layer_idx,
            self.layers[layer_idx].offset
        );
        Ok(())
    }

    /// Tokens processed by `layer_idx`, zero if it has no entry yet.
    pub fn seq_length(&self, layer_idx: usize) -> usize {
        self.layers.get(layer_idx).map_or(0, |l| l.offset)
    }

    pub fn reset(&mut self) {
        self.layers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_appends_then_accumulates() {
        let mut cache = Cache::new();
        assert!(cache.is_empty());
        cache.update(None, None, 0, 5).unwrap();
        cache.update(None, None, 1, 5).unwrap();
        cache.update(None, None, 0, 1).unwrap();
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.seq_length(0), 6);
        assert_eq!(cache.seq_length(1), 5);
        assert_eq!(cache.seq_length(7), 0);
    }

    #[test]
    fn test_update_without_states_keeps_previous() {
        let dev = candle_core::Device::Cpu;
        let zeros = |shape: &[usize]| Tensor::zeros(shape, candle_core::DType::F32, &dev).unwrap();
        let slots = SlotState {
            hk: zeros(&[1, 1, 2, 3]),
            hv: zeros(&[1, 1, 3, 2]),
        };
        let conv = ConvState {
            q: zeros(&[1, 4, 2]),
            k: zeros(&[1, 4, 2]),
            v: zeros(&[1, 4, 2]),
        };
        let mut cache = Cache::new();
        cache.update(Some(slots), Some(conv), 0, 4).unwrap();
        cache.update(None, None, 0, 2).unwrap();

        let entry = cache.get(0).unwrap();
        assert_eq!(entry.recurrent_state.as_ref().unwrap().hk.dims(), &[1, 1, 2, 3]);
        assert_eq!(entry.conv_state.as_ref().unwrap().q.dims(), &[1, 4, 2]);
        assert_eq!(cache.seq_length(0), 6);
    }

    #[test]
    fn test_update_rejects_gap() {
        let mut cache = Cache::new();
        assert!(matches!(
            cache.update(None, None, 2, 1),
            Err(Error::CacheLayer { layer_idx: 2, len: 0 })
        ));
    }

    #[test]
    fn test_reset_clears_layers() {
        let mut cache = Cache::new();
        cache.update(None, None, 0, 3).unwrap();
        cache.reset();
        assert_eq!(cache.len(), 0);
        assert!(cache.get(0).is_none());
    }
}
