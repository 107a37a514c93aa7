#![allow(clippy::derive_partial_eq_without_eq)]
tonic::include_proto!("skiff_rpc");

impl DeployRequest {
    pub fn intent(intent: DeployIntent) -> Self {
        DeployRequest {
            msg: Some(deploy_request::Msg::Intent(intent)),
        }
    }
    pub fn content(data: Vec<u8>) -> Self {
        DeployRequest {
            msg: Some(deploy_request::Msg::Content(DeployContent { data })),
        }
    }
    pub fn end() -> Self {
        DeployRequest {
            msg: Some(deploy_request::Msg::End(DeployEnd {})),
        }
    }
}

impl DeployResponse {
    pub fn ready(chunk_size: u64) -> Self {
        DeployResponse {
            msg: Some(deploy_response::Msg::Ready(DeployReady { chunk_size })),
        }
    }
    pub fn progress(bytes_received: u64) -> Self {
        DeployResponse {
            msg: Some(deploy_response::Msg::Progress(DeployProgress { bytes_received })),
        }
    }
    pub fn success(name: String, tag: String, image_size: u64, digest: String) -> Self {
        DeployResponse {
            msg: Some(deploy_response::Msg::Success(DeploySuccess {
                name,
                tag,
                image_size,
                digest,
            })),
        }
    }
}

impl DownloadImageResponse {
    pub fn info(size: u64, chunk_size: u64) -> Self {
        DownloadImageResponse {
            msg: Some(download_image_response::Msg::Info(DownloadInfo { size, chunk_size })),
        }
    }
    pub fn chunk(data: Vec<u8>) -> Self {
        DownloadImageResponse {
            msg: Some(download_image_response::Msg::Chunk(DownloadChunk { data })),
        }
    }
}

impl LifecycleResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        LifecycleResponse {
            message: message.into(),
        }
    }
}
