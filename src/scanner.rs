//! Byte-pattern scanning over memory ranges and module images.

use crate::address::Address;

/// A byte pattern with a significance mask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pattern: Vec<u8>,
    mask: Vec<bool>,
}

impl Signature {
    /// Builds a signature from raw pattern bytes and an `x`/`?` mask, one
    /// mask character per byte.
    #[must_use]
    pub fn from_code_mask(pattern: &[u8], mask: &str) -> Self {
        let mask: Vec<bool> = mask.bytes().map(|ch| ch == b'x').collect();
        let pattern = pattern
            .iter()
            .zip(&mask)
            .map(|(&byte, &significant)| if significant { byte } else { 0 })
            .collect();
        Self { pattern, mask }
    }

    /// Builds a signature from an IDA-style string, e.g. `"48 8B ?? 05"`.
    ///
    /// `?` and `??` are wildcards; anything else is a hex byte.
    #[must_use]
    pub fn from_ida(pattern: &str) -> Self {
        let mut bytes = Vec::new();
        let mut mask = Vec::new();

        for token in pattern.split_whitespace() {
            if token.starts_with('?') {
                bytes.push(0);
                mask.push(false);
            } else if let Ok(byte) = u8::from_str_radix(token, 16) {
                bytes.push(byte);
                mask.push(true);
            }
        }

        Self {
            pattern: bytes,
            mask,
        }
    }

    /// The pattern bytes (insignificant positions are zero).
    #[must_use]
    pub fn pattern(&self) -> &[u8] {
        &self.pattern
    }

    /// The significance mask.
    #[must_use]
    pub fn mask(&self) -> &[bool] {
        &self.mask
    }

    fn matches(&self, window: &[u8]) -> bool {
        self.pattern
            .iter()
            .zip(&self.mask)
            .zip(window)
            .all(|((&byte, &significant), &have)| !significant || byte == have)
    }
}

/// A linear pattern scanner over one contiguous memory range.
#[derive(Debug, Clone)]
pub struct Scanner {
    start: Address,
    end: Address,
}

impl Scanner {
    /// Creates a scanner over `[start, start + size)`.
    ///
    /// # Safety
    ///
    /// The whole range must stay readable for the scanner's lifetime.
    #[must_use]
    pub unsafe fn new(start: Address, size: usize) -> Self {
        Self {
            start,
            end: start + size,
        }
    }

    /// Creates a scanner over the image of a loaded module.
    ///
    /// # Safety
    ///
    /// The module must stay loaded for the scanner's lifetime.
    #[cfg(windows)]
    #[must_use]
    pub unsafe fn from_module(name: &str) -> Option<Self> {
        use crate::module;

        let handle = module::module_handle(name);
        if !handle.valid() {
            return None;
        }
        let base = module::module_allocation_base(handle);
        let size = module::module_image_size(base);
        if size == 0 {
            return None;
        }
        Some(Self::new(base, size))
    }

    /// The first match of `signature` in the range.
    #[must_use]
    pub fn find(&self, signature: &Signature) -> Option<Address> {
        let len = signature.pattern().len();
        let total = (self.end - self.start).value();
        if len == 0 || len > total {
            return None;
        }

        let haystack =
            unsafe { std::slice::from_raw_parts(self.start.as_ptr::<u8>(), total) };

        haystack
            .windows(len)
            .position(|window| signature.matches(window))
            .map(|offset| self.start + offset)
    }
}
