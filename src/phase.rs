//! Integrator phases and the gradient mask that goes with them.
//!
//! Each training step runs three sub-steps, one per [`Phase`]. The phase is an
//! explicit argument to every forward/backward call, so two networks never
//! share hidden training toggles.

use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Active sub-parametrization of a block.
pub enum Phase {
    /// Weight `K Vᵗ`; only `K = U S` is free.
    K,
    /// Weight `U Lᵗ`; only `L = V Sᵗ` is free.
    L,
    /// Weight `Ũ S̃ Ṽᵗ` on the augmented bases; `S̃` and the bias are free.
    S,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::K, Phase::L, Phase::S];
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::K => "K",
            Phase::L => "L",
            Phase::S => "S",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Position of a learnable tensor in a block's gradient tuple.
pub enum Slot {
    K,
    L,
    S,
    Bias,
}

impl Slot {
    /// Tuple order. The optimizer walks slots in exactly this order.
    pub const ALL: [Slot; 4] = [Slot::K, Slot::L, Slot::S, Slot::Bias];

    #[inline]
    pub(crate) fn index(self) -> usize {
        match self {
            Slot::K => 0,
            Slot::L => 1,
            Slot::S => 2,
            Slot::Bias => 3,
        }
    }
}

/// Gradient tuple `(K, L, S, bias)` of one block.
///
/// Every slot is a flat buffer shaped like its parameter. Slots the backward
/// pass does not touch hold explicit zeros, never "missing" values.
#[derive(Debug, Clone, Default)]
pub struct BlockGradients {
    slots: [Vec<f32>; 4],
    live: [bool; 4],
}

impl BlockGradients {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn get(&self, slot: Slot) -> &[f32] {
        &self.slots[slot.index()]
    }

    #[inline]
    pub fn get_mut(&mut self, slot: Slot) -> &mut [f32] {
        &mut self.slots[slot.index()]
    }

    /// Whether the optimizer should update this slot's parameter.
    ///
    /// Slots zeroed by a [`GradientMask`] are not live.
    #[inline]
    pub fn is_live(&self, slot: Slot) -> bool {
        self.live[slot.index()]
    }

    /// Resize every slot to its parameter length and zero it.
    ///
    /// `lens` is in [`Slot::ALL`] order. All slots start live; masking is a
    /// separate, explicit step.
    pub(crate) fn reset(&mut self, lens: [usize; 4]) {
        for (buf, len) in self.slots.iter_mut().zip(lens) {
            buf.clear();
            buf.resize(len, 0.0);
        }
        self.live = [true; 4];
    }

    /// Sum of squares over live slots.
    pub fn norm_sq(&self) -> f32 {
        Slot::ALL
            .iter()
            .filter(|s| self.is_live(**s))
            .flat_map(|s| self.get(*s))
            .map(|g| g * g)
            .sum()
    }
}

/// Zeroes every gradient slot a phase does not own.
///
/// - K owns `K`
/// - L owns `L`
/// - S owns `S` and the bias
///
/// The bias is therefore zeroed during K- and L-steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GradientMask {
    phase: Phase,
}

impl GradientMask {
    pub fn for_phase(phase: Phase) -> Self {
        Self { phase }
    }

    #[inline]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    #[inline]
    pub fn owns(&self, slot: Slot) -> bool {
        matches!(
            (self.phase, slot),
            (Phase::K, Slot::K) | (Phase::L, Slot::L) | (Phase::S, Slot::S) | (Phase::S, Slot::Bias)
        )
    }

    /// Zero and deactivate non-owned slots, in tuple order.
    pub fn apply(&self, grads: &mut BlockGradients) {
        for slot in Slot::ALL {
            if !self.owns(slot) {
                grads.get_mut(slot).fill(0.0);
                grads.live[slot.index()] = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(lens: [usize; 4]) -> BlockGradients {
        let mut g = BlockGradients::new();
        g.reset(lens);
        for slot in Slot::ALL {
            g.get_mut(slot).fill(1.0);
        }
        g
    }

    #[test]
    fn k_mask_keeps_only_k() {
        let mut g = filled([2, 3, 4, 5]);
        GradientMask::for_phase(Phase::K).apply(&mut g);

        assert!(g.get(Slot::K).iter().all(|&v| v == 1.0));
        for slot in [Slot::L, Slot::S, Slot::Bias] {
            assert!(g.get(slot).iter().all(|&v| v == 0.0), "{slot:?} not zeroed");
            assert!(!g.is_live(slot));
        }
        assert_eq!(g.norm_sq(), 2.0);
    }

    #[test]
    fn s_mask_keeps_coupling_and_bias() {
        let mut g = filled([2, 3, 4, 5]);
        GradientMask::for_phase(Phase::S).apply(&mut g);

        assert!(g.is_live(Slot::S) && g.is_live(Slot::Bias));
        assert!(!g.is_live(Slot::K) && !g.is_live(Slot::L));
        assert_eq!(g.get(Slot::Bias), &[1.0; 5]);
        assert_eq!(g.get(Slot::K), &[0.0; 2]);
    }

    #[test]
    fn masking_preserves_slot_shapes() {
        let mut g = filled([2, 3, 4, 5]);
        GradientMask::for_phase(Phase::L).apply(&mut g);
        let lens: Vec<usize> = Slot::ALL.iter().map(|s| g.get(*s).len()).collect();
        assert_eq!(lens, vec![2, 3, 4, 5]);
    }

    #[test]
    fn bias_is_owned_only_by_s() {
        for phase in Phase::ALL {
            let owns = GradientMask::for_phase(phase).owns(Slot::Bias);
            assert_eq!(owns, phase == Phase::S);
        }
    }
}
