//! Length compensation.
//!
//! The network engine only accepts lengths that are whole multiples of its group
//! size. Arbitrary lengths are padded at the *front* with sentinel slots: logical
//! index `i` lives at physical index `i + pad`, and any sorted value `< pad` points
//! at a padding slot and is dropped from the result.

/// Pads lengths up to a multiple of `granularity`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LengthCompensator {
    granularity: usize,
}

/// Physical layout of one logical length
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Wrap {
    /// Caller-visible element count
    pub logical_len:   usize,
    /// Device element count, a multiple of the granularity
    pub corrected_len: usize,
    /// Sentinel slots in front, always `< granularity`
    pub pad:           usize,
}

impl LengthCompensator {
    /// Compensator for `granularity` (1 disables padding)
    pub fn new(granularity: usize) -> Self {
        Self { granularity: granularity.max(1) }
    }

    /// Minimum granularity
    pub fn granularity(&self) -> usize {
        self.granularity
    }

    /// `pad = (G - N mod G) mod G`, `corrected = N + pad`
    pub fn wrap(&self, logical_len: usize) -> Wrap {
        let g = self.granularity;
        let pad = (g - logical_len % g) % g;
        Wrap { logical_len, corrected_len: logical_len + pad, pad }
    }
}

impl Wrap {
    /// Physical index of logical index `i`
    #[inline]
    pub fn compensate_index(&self, i: usize) -> usize {
        i + self.pad
    }

    /// Logical index of physical index `p`, `None` for a padding slot
    #[inline]
    pub fn decompensate(&self, p: usize) -> Option<usize> {
        p.checked_sub(self.pad)
    }

    /// Physical word array: `pad` sentinels followed by the logical words.
    pub fn pad_words<I>(&self, sentinel: &[u32], logical: I) -> Vec<u32>
    where
        I: IntoIterator<Item = u32>,
    {
        let stride = sentinel.len();
        let mut words = Vec::with_capacity(self.corrected_len * stride);
        for _ in 0..self.pad {
            words.extend_from_slice(sentinel);
        }
        words.extend(logical);
        words
    }

    /// Drops padding results and maps the rest back to logical indices.
    pub fn strip(&self, physical: &[u32]) -> Vec<u32> {
        physical
            .iter()
            .filter_map(|&p| self.decompensate(p as usize).map(|i| i as u32))
            .collect()
    }
}
