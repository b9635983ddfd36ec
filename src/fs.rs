// Copyright © 2026 Rudis Laboratories LLC

use log::info;
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::error::Result;
use crate::manager::{empty_request, SmpManager};
use crate::nmp_hdr::*;
use crate::response::ResponseKind;
use crate::transfer::download::Download;
use crate::transfer::{
    self, ChunkReader, ChunkWriter, Progress, TransferCallback, TransferController, UploadOptions,
};
use crate::transport::Transport;

/// File system management group (group 8).
#[derive(Clone)]
pub struct FsManager {
    manager: SmpManager,
}

impl FsManager {
    pub fn new(transport: Arc<dyn Transport>) -> FsManager {
        FsManager {
            manager: SmpManager::new(transport, NmpGroup::Fs),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        self.manager.transport()
    }

    /// Upload a file to `remote_path` on the device
    pub fn upload_file(
        &self,
        remote_path: &str,
        data: Arc<[u8]>,
        options: UploadOptions,
        controller: &TransferController,
        progress: &mut Progress<'_>,
    ) -> Result<()> {
        info!("upload file: {} ({} bytes)", remote_path, data.len());
        let writer = FileUploadWriter::new(self.transport().clone(), remote_path);
        transfer::upload(&writer, data, options, controller, progress)?;
        info!("uploaded file {}", remote_path);
        Ok(())
    }

    /// Download the file at `remote_path` from the device
    pub fn download_file(
        &self,
        remote_path: &str,
        controller: &TransferController,
        progress: &mut Progress<'_>,
    ) -> Result<Vec<u8>> {
        info!("download file: {}", remote_path);
        let reader = FileDownloadReader::new(self.transport().clone(), remote_path);
        let mut download = Download::new(&reader);
        transfer::run(&mut download, controller, progress)?;
        let data = download.into_data()?;
        info!("downloaded {} bytes", data.len());
        Ok(data)
    }

    pub fn upload_file_async(
        &self,
        remote_path: &str,
        data: Arc<[u8]>,
        options: UploadOptions,
        callback: impl TransferCallback<()> + 'static,
    ) -> Result<(Arc<TransferController>, JoinHandle<()>)> {
        let controller = Arc::new(TransferController::new());
        let manager = self.clone();
        let path = remote_path.to_string();
        let handle = transfer::spawn(
            controller.clone(),
            move |controller, progress| manager.upload_file(&path, data, options, controller, progress),
            callback,
        )?;
        Ok((controller, handle))
    }

    pub fn download_file_async(
        &self,
        remote_path: &str,
        callback: impl TransferCallback<Vec<u8>> + 'static,
    ) -> Result<(Arc<TransferController>, JoinHandle<()>)> {
        let controller = Arc::new(TransferController::new());
        let manager = self.clone();
        let path = remote_path.to_string();
        let handle = transfer::spawn(
            controller.clone(),
            move |controller, progress| manager.download_file(&path, controller, progress),
            callback,
        )?;
        Ok((controller, handle))
    }

    /// Get file status (size) from the device
    pub fn stat(&self, path: &str) -> Result<FsStatRsp> {
        info!("stat file: {}", path);
        let req = FsStatReq {
            name: path.to_string(),
        };
        self.manager.request(NmpOp::Read, NmpIdFs::FileStat, &req)
    }

    /// Calculate hash/checksum of a file on the device
    pub fn hash(
        &self,
        path: &str,
        hash_type: Option<&str>,
        off: Option<u32>,
        len: Option<u32>,
    ) -> Result<FsHashRsp> {
        info!("hash file: {}", path);
        let req = FsHashReq {
            name: path.to_string(),
            hash_type: hash_type.map(|s| s.to_string()),
            off,
            len,
        };
        self.manager.request(NmpOp::Read, NmpIdFs::FileHash, &req)
    }

    pub fn supported_hash_types(&self) -> Result<FsSupportedHashTypesRsp> {
        self.manager
            .request(NmpOp::Read, NmpIdFs::SupportedHashTypes, &empty_request())
    }

    /// Close any file the device holds open for an interrupted transfer.
    pub fn close(&self) -> Result<()> {
        self.manager.send(
            NmpOp::Write,
            NmpIdFs::FileClose,
            &empty_request(),
            ResponseKind::Generic,
        )?;
        Ok(())
    }
}

/// Encodes file upload requests; the first carries the total length.
pub struct FileUploadWriter {
    manager: SmpManager,
    name: String,
}

impl FileUploadWriter {
    pub fn new(transport: Arc<dyn Transport>, name: &str) -> Self {
        FileUploadWriter {
            manager: SmpManager::new(transport, NmpGroup::Fs),
            name: name.to_string(),
        }
    }
}

impl ChunkWriter for FileUploadWriter {
    fn transport(&self) -> &Arc<dyn Transport> {
        self.manager.transport()
    }

    fn chunk_packet(&self, data: &[u8], offset: usize, len: usize) -> Result<Vec<u8>> {
        let req = FsUploadReq {
            name: self.name.clone(),
            off: offset as u32,
            data: data[offset..offset + len].to_vec(),
            len: (offset == 0).then_some(data.len() as u32),
        };
        self.manager.build(NmpOp::Write, NmpIdFs::File, &req)
    }
}

pub struct FileDownloadReader {
    manager: SmpManager,
    name: String,
}

impl FileDownloadReader {
    pub fn new(transport: Arc<dyn Transport>, name: &str) -> Self {
        FileDownloadReader {
            manager: SmpManager::new(transport, NmpGroup::Fs),
            name: name.to_string(),
        }
    }
}

impl ChunkReader for FileDownloadReader {
    fn transport(&self) -> &Arc<dyn Transport> {
        self.manager.transport()
    }

    fn read_packet(&self, offset: usize) -> Result<Vec<u8>> {
        let req = FsDownloadReq {
            name: self.name.clone(),
            off: offset as u32,
        };
        self.manager.build(NmpOp::Read, NmpIdFs::File, &req)
    }
}
