// Copyright © 2026 Rudis Laboratories LLC

use log::debug;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::mcuboot::McuBootImage;

/// Slot new images are written to unless told otherwise.
pub const SECONDARY_SLOT: u32 = 1;

/// One firmware image to deliver to `(image_index, slot)`.
#[derive(Debug, Clone)]
pub struct TargetImage {
    pub image_index: u32,
    pub slot: u32,
    pub data: Arc<[u8]>,
    /// Hash the device will report for this image once written.
    pub hash: Vec<u8>,
}

impl TargetImage {
    pub fn new(image_index: u32, slot: u32, data: Arc<[u8]>, hash: Vec<u8>) -> TargetImage {
        TargetImage {
            image_index,
            slot,
            data,
            hash,
        }
    }

    /// Build a target from an MCUboot image file, taking the hash from its TLVs.
    pub fn from_binary(image_index: u32, slot: u32, data: Vec<u8>) -> Result<TargetImage> {
        let image = McuBootImage::parse(&data)?;
        let hash = image.hash()?.to_vec();
        debug!(
            "image {} version {} hash {}",
            image_index,
            image.header.version,
            hex::encode(&hash)
        );
        Ok(TargetImage::new(image_index, slot, data.into(), hash))
    }
}

/// The images of one upgrade session, at most one per `(image_index, slot)`.
#[derive(Debug, Clone, Default)]
pub struct ImageSet {
    images: Vec<TargetImage>,
}

impl ImageSet {
    pub fn new() -> ImageSet {
        ImageSet::default()
    }

    /// Add `image`, replacing any image already targeting the same slot.
    pub fn add(&mut self, image: TargetImage) -> &mut ImageSet {
        self.remove(image.image_index, image.slot);
        self.images.push(image);
        self
    }

    /// Add an MCUboot image file for `image_index`, secondary slot.
    pub fn add_binary(&mut self, image_index: u32, data: Vec<u8>) -> Result<&mut ImageSet> {
        let image = TargetImage::from_binary(image_index, SECONDARY_SLOT, data)?;
        Ok(self.add(image))
    }

    pub fn remove(&mut self, image_index: u32, slot: u32) -> Option<TargetImage> {
        let pos = self
            .images
            .iter()
            .position(|i| i.image_index == image_index && i.slot == slot)?;
        Some(self.images.remove(pos))
    }

    pub fn images(&self) -> &[TargetImage] {
        &self.images
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub(crate) fn check(&self) -> Result<()> {
        if self.is_empty() {
            return Err(Error::InvalidArgument("no images to upgrade".to_string()));
        }
        match self.images.iter().find(|i| i.data.is_empty()) {
            Some(i) => Err(Error::InvalidArgument(format!(
                "image {} slot {} is empty",
                i.image_index, i.slot
            ))),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcuboot::build_test_image;

    #[test]
    fn one_image_per_slot() {
        let mut set = ImageSet::new();
        set.add_binary(0, build_test_image(&[1u8; 64], false)).unwrap();
        set.add_binary(0, build_test_image(&[2u8; 64], false)).unwrap();
        set.add_binary(1, build_test_image(&[3u8; 64], true)).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.images()[0].image_index, 0);
        assert_eq!(set.images()[0].data[40], 2);
        assert!(set.remove(1, SECONDARY_SLOT).is_some());
        assert!(set.remove(1, SECONDARY_SLOT).is_none());
    }

    #[test]
    fn raw_binary_is_rejected() {
        let err = TargetImage::from_binary(0, 1, vec![0u8; 100]).unwrap_err();
        assert!(matches!(err, Error::InvalidImage(_)));
        assert!(ImageSet::new().check().is_err());
    }
}
