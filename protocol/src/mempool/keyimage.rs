//! Keyimages held by pending UTXO transactions.

use parking_lot::RwLock;
use std::collections::HashSet;

use super::tx::KeyImage;

#[derive(Debug, Default)]
pub struct KeyImageSet {
    images: RwLock<HashSet<KeyImage>>,
}

impl KeyImageSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&self) {
        self.images.write().clear();
    }

    pub fn exists(&self, image: &KeyImage) -> bool {
        self.images.read().contains(image)
    }

    pub fn contains_any(&self, images: &[KeyImage]) -> bool {
        let set = self.images.read();
        images.iter().any(|k| set.contains(k))
    }

    /// Returns `false` if the image was already present.
    pub fn push(&self, image: KeyImage) -> bool {
        self.images.write().insert(image)
    }

    pub fn remove(&self, image: &KeyImage) -> bool {
        self.images.write().remove(image)
    }

    pub fn remove_keys(&self, images: &[KeyImage]) {
        let mut set = self.images.write();
        for image in images {
            set.remove(image);
        }
    }

    pub fn len(&self) -> usize {
        self.images.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_reports_duplicates() {
        let set = KeyImageSet::new();
        assert!(set.push(KeyImage([1; 32])));
        assert!(!set.push(KeyImage([1; 32])));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn remove_keys_and_reset() {
        let set = KeyImageSet::new();
        set.push(KeyImage([1; 32]));
        set.push(KeyImage([2; 32]));
        set.push(KeyImage([3; 32]));

        set.remove_keys(&[KeyImage([1; 32]), KeyImage([9; 32])]);
        assert!(!set.exists(&KeyImage([1; 32])));
        assert!(set.contains_any(&[KeyImage([9; 32]), KeyImage([2; 32])]));

        set.reset();
        assert!(set.is_empty());
    }
}
