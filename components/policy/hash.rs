/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use sha2::{Digest, Sha256};

/// Accumulator for the lookup digest.
///
/// The `hash` hook appends key material here; the engine finalizes it into
/// the request digest. Each fragment is terminated with a NUL so that
/// `add("ab"); add("c")` and `add("a"); add("bc")` hash differently.
pub struct HashKey {
    ctx: Sha256,
}

impl HashKey {
    pub fn new() -> HashKey {
        HashKey { ctx: Sha256::new() }
    }

    /// Append one fragment of key material.
    pub fn add(&mut self, data: &[u8]) {
        self.ctx.update(data);
        self.ctx.update([0u8]);
    }

    pub fn finish(self) -> [u8; 32] {
        self.ctx.finalize().into()
    }
}

impl Default for HashKey {
    fn default() -> HashKey {
        HashKey::new()
    }
}

#[cfg(test)]
mod tests {
    use super::HashKey;

    #[test]
    fn fragments_are_delimited() {
        let mut a = HashKey::new();
        a.add(b"ab");
        a.add(b"c");
        let mut b = HashKey::new();
        b.add(b"a");
        b.add(b"bc");
        assert_ne!(a.finish(), b.finish());
    }

    #[test]
    fn same_material_same_digest() {
        let mut a = HashKey::new();
        a.add(b"/index.html");
        a.add(b"origin.example");
        let mut b = HashKey::new();
        b.add(b"/index.html");
        b.add(b"origin.example");
        assert_eq!(a.finish(), b.finish());
    }
}
