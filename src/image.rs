// Copyright © 2023-2024 Vouch.io LLC, 2026 Rudis Laboratories LLC

use log::{debug, info};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::error::Result;
use crate::manager::{empty_request, SmpManager};
use crate::nmp_hdr::*;
use crate::response::ResponseKind;
use crate::transfer::{self, ChunkWriter, Progress, TransferCallback, TransferController, UploadOptions};
use crate::transport::Transport;

/// Image management group (group 1).
#[derive(Clone)]
pub struct ImageManager {
    manager: SmpManager,
}

impl ImageManager {
    pub fn new(transport: Arc<dyn Transport>) -> ImageManager {
        ImageManager {
            manager: SmpManager::new(transport, NmpGroup::Image),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        self.manager.transport()
    }

    /// Read the state of all image slots.
    pub fn list(&self) -> Result<ImageStateRsp> {
        info!("send image list request");
        self.manager
            .request(NmpOp::Read, NmpIdImage::State, &empty_request())
    }

    /// Mark the image with `hash` pending for a single test boot.
    pub fn test(&self, hash: &[u8]) -> Result<ImageStateRsp> {
        info!("send image test request: {}", hex::encode(hash));
        let req = ImageStateReq {
            hash: hash.to_vec(),
            confirm: Some(false),
        };
        self.manager.request(NmpOp::Write, NmpIdImage::State, &req)
    }

    /// Confirm the image with `hash`, or the running image when `None`.
    pub fn confirm(&self, hash: Option<&[u8]>) -> Result<ImageStateRsp> {
        info!(
            "send image confirm request: {}",
            hash.map(hex::encode).unwrap_or_else(|| "running image".to_string())
        );
        let req = ImageStateReq {
            hash: hash.map(<[u8]>::to_vec).unwrap_or_default(),
            confirm: Some(true),
        };
        self.manager.request(NmpOp::Write, NmpIdImage::State, &req)
    }

    /// Erase the secondary slot, or `slot` when given.
    pub fn erase(&self, slot: Option<u32>) -> Result<()> {
        info!("send image erase request");
        let req = ImageEraseReq { slot };
        self.manager
            .send(NmpOp::Write, NmpIdImage::Erase, &req, ResponseKind::Generic)?;
        Ok(())
    }

    /// Upload `data` as image `image_index`, blocking until done.
    pub fn upload(
        &self,
        image_index: u32,
        data: Arc<[u8]>,
        options: UploadOptions,
        controller: &TransferController,
        progress: &mut Progress<'_>,
    ) -> Result<()> {
        info!("upload image {}: {} bytes", image_index, data.len());
        let writer = ImageUploadWriter::new(self.transport().clone(), image_index, &data);
        transfer::upload(&writer, data, options, controller, progress)
    }

    /// Upload on a background thread, reporting through `callback`.
    pub fn upload_async(
        &self,
        image_index: u32,
        data: Arc<[u8]>,
        options: UploadOptions,
        callback: impl TransferCallback<()> + 'static,
    ) -> Result<(Arc<TransferController>, JoinHandle<()>)> {
        let controller = Arc::new(TransferController::new());
        let manager = self.clone();
        let handle = transfer::spawn(
            controller.clone(),
            move |controller, progress| {
                manager.upload(image_index, data, options, controller, progress)
            },
            callback,
        )?;
        Ok((controller, handle))
    }
}

/// Encodes image upload requests. The first chunk also carries the total
/// length, the SHA-256 of the whole image and, for secondary images, the
/// image number.
pub struct ImageUploadWriter {
    manager: SmpManager,
    image_index: u32,
    sha: Vec<u8>,
}

impl ImageUploadWriter {
    pub fn new(transport: Arc<dyn Transport>, image_index: u32, data: &[u8]) -> Self {
        let sha = Sha256::digest(data).to_vec();
        debug!("image sha256: {}", hex::encode(&sha));
        ImageUploadWriter {
            manager: SmpManager::new(transport, NmpGroup::Image),
            image_index,
            sha,
        }
    }
}

impl ChunkWriter for ImageUploadWriter {
    fn transport(&self) -> &Arc<dyn Transport> {
        self.manager.transport()
    }

    fn chunk_packet(&self, data: &[u8], offset: usize, len: usize) -> Result<Vec<u8>> {
        let first = offset == 0;
        let req = ImageUploadReq {
            data: data[offset..offset + len].to_vec(),
            image_num: (first && self.image_index != 0).then_some(self.image_index),
            len: first.then_some(data.len() as u32),
            off: offset as u32,
            data_sha: first.then(|| self.sha.clone()),
            upgrade: None,
        };
        self.manager.build(NmpOp::Write, NmpIdImage::Upload, &req)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::test_device::TestDevice;
    use std::sync::mpsc;
    use std::time::Instant;

    #[test]
    fn first_chunk_carries_metadata() {
        let device = TestDevice::new();
        let data = vec![9u8; 64];
        let writer = ImageUploadWriter::new(device.clone(), 2, &data);

        let first = writer.chunk_packet(&data, 0, 16).unwrap();
        let req: ImageUploadReq = serde_cbor::from_slice(&first[NMP_HDR_SIZE..]).unwrap();
        assert_eq!(req.len, Some(64));
        assert_eq!(req.image_num, Some(2));
        assert_eq!(req.data_sha.unwrap(), Sha256::digest(&data).to_vec());

        let later = writer.chunk_packet(&data, 16, 16).unwrap();
        let req: ImageUploadReq = serde_cbor::from_slice(&later[NMP_HDR_SIZE..]).unwrap();
        assert_eq!((req.len, req.image_num, req.off), (None, None, 16));
        assert!(req.data_sha.is_none());
    }

    #[test]
    fn test_and_confirm_update_slots() {
        let device = TestDevice::new();
        let images = ImageManager::new(device.clone());
        let data: Arc<[u8]> = crate::mcuboot::build_test_image(&[3u8; 700], false).into();
        images
            .upload(0, data.clone(), UploadOptions::default(), &TransferController::new(), &mut |_, _, _| {})
            .unwrap();

        let hash = device.slot(0, 1).unwrap().hash;
        let state = images.test(&hash).unwrap();
        assert!(state.find_by_hash(&hash).unwrap().pending);

        let state = images.confirm(Some(&hash)).unwrap();
        assert!(state.find_by_hash(&hash).unwrap().permanent);

        images.erase(None).unwrap();
        assert!(images.list().unwrap().find_slot(0, 1).is_none());
    }

    #[test]
    fn unknown_hash_is_rejected() {
        let device = TestDevice::new();
        let images = ImageManager::new(device.clone());
        let err = images.test(&[0xee; 32]).unwrap_err();
        assert!(matches!(err, Error::Device { .. }));
    }

    enum Outcome {
        Completed,
        Failed,
        Canceled,
    }

    struct Reporter(mpsc::Sender<Outcome>);

    impl TransferCallback<()> for Reporter {
        fn on_progress(&mut self, _: usize, _: usize, _: Instant) {}

        fn on_completed(&mut self, _: ()) {
            let _ = self.0.send(Outcome::Completed);
        }

        fn on_failed(&mut self, _: Error) {
            let _ = self.0.send(Outcome::Failed);
        }

        fn on_canceled(&mut self) {
            let _ = self.0.send(Outcome::Canceled);
        }
    }

    #[test]
    fn async_upload_reports_once() {
        let device = TestDevice::new();
        let images = ImageManager::new(device.clone());
        let (tx, rx) = mpsc::channel();
        let (_, handle) = images
            .upload_async(0, vec![1u8; 1500].into(), UploadOptions::default(), Reporter(tx))
            .unwrap();
        handle.join().unwrap();
        assert!(matches!(rx.try_recv(), Ok(Outcome::Completed)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn async_upload_cancel_reports_canceled() {
        let device = TestDevice::with_async_delivery(std::time::Duration::from_millis(5));
        let images = ImageManager::new(device.clone());
        let (tx, rx) = mpsc::channel();
        let (controller, handle) = images
            .upload_async(
                0,
                vec![1u8; 50_000].into(),
                UploadOptions {
                    window_capacity: 2,
                    memory_alignment: 1,
                },
                Reporter(tx),
            )
            .unwrap();
        controller.cancel();
        controller.cancel();
        handle.join().unwrap();
        assert!(matches!(rx.try_recv(), Ok(Outcome::Canceled)));
        assert!(rx.try_recv().is_err());
    }
}
