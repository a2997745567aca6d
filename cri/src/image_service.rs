//! CRI ImageService implementation.
//!
//! List, status and remove go straight through to the engine. Pull is
//! watched by a progress deadline that restarts on every event the engine
//! reports, so a slow pull survives while a stuck one is abandoned.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use futures::StreamExt;
use tracing::{debug, info, warn};

use dockershim_core::{EntityKind, Result, ShimError};

use crate::cri_api::*;
use crate::engine::{EngineClient, RegistryCredentials};
use crate::translate::image_from_engine;

/// Image operations backed by the engine's image store.
#[derive(Clone)]
pub struct ImageService {
    engine: Arc<dyn EngineClient>,
    pull_deadline: Duration,
}

impl ImageService {
    pub fn new(engine: Arc<dyn EngineClient>, pull_deadline: Duration) -> Self {
        Self {
            engine,
            pull_deadline,
        }
    }

    pub async fn list_images(&self, req: ListImagesRequest) -> Result<ListImagesResponse> {
        let wanted = req
            .filter
            .and_then(|f| f.image)
            .map(|spec| spec.image)
            .filter(|image| !image.is_empty());

        let images = self
            .engine
            .list_images()
            .await
            .map_err(|e| e.classify(EntityKind::Image, "list"))?;

        let images = images
            .iter()
            .filter(|img| match &wanted {
                Some(reference) => image_matches(img.id.as_str(), &img.repo_tags, &img.repo_digests, reference),
                None => true,
            })
            .map(image_from_engine)
            .collect();
        Ok(ListImagesResponse { images })
    }

    /// Status of one image. A missing image is not an error; the response
    /// simply carries no image.
    pub async fn image_status(&self, req: ImageStatusRequest) -> Result<ImageStatusResponse> {
        let reference = required_reference(req.image)?;

        let image = match self.engine.inspect_image(&reference).await {
            Ok(image) => image,
            Err(e) if e.is_not_found() => {
                debug!(image = %reference, "Image not present");
                return Ok(ImageStatusResponse::default());
            }
            Err(e) => return Err(e.classify(EntityKind::Image, &reference)),
        };

        let mut info = HashMap::new();
        if req.verbose {
            let layers = self
                .engine
                .image_history(&image.id)
                .await
                .map_err(|e| e.classify(EntityKind::Image, &reference))?;
            let history: Vec<serde_json::Value> = layers
                .iter()
                .map(|layer| {
                    serde_json::json!({
                        "id": layer.id,
                        "created": layer.created,
                        "createdBy": layer.created_by,
                        "size": layer.size,
                        "comment": layer.comment,
                    })
                })
                .collect();
            info.insert("history".to_string(), serde_json::to_string(&history)?);
        }

        Ok(ImageStatusResponse {
            image: Some(image_from_engine(&image)),
            info,
        })
    }

    pub async fn pull_image(&self, req: PullImageRequest) -> Result<PullImageResponse> {
        let reference = required_reference(req.image)?;
        let credentials = req.auth.map(credentials_from_auth).transpose()?;

        info!(image = %reference, "CRI PullImage");
        self.pull(&reference, credentials).await?;

        let image = self
            .engine
            .inspect_image(&reference)
            .await
            .map_err(|e| e.classify(EntityKind::Image, &reference))?;
        info!(image = %reference, image_ref = %image.id, "Image pulled");
        Ok(PullImageResponse { image_ref: image.id })
    }

    /// Remove an image and every tag pointing at it. Removing an image that
    /// is already gone succeeds.
    pub async fn remove_image(&self, req: RemoveImageRequest) -> Result<RemoveImageResponse> {
        let reference = required_reference(req.image)?;
        info!(image = %reference, "CRI RemoveImage");

        let image = match self.engine.inspect_image(&reference).await {
            Ok(image) => image,
            Err(e) if e.is_not_found() => return Ok(RemoveImageResponse {}),
            Err(e) => return Err(e.classify(EntityKind::Image, &reference)),
        };

        let targets = if image.repo_tags.is_empty() {
            vec![image.id.clone()]
        } else {
            image.repo_tags.clone()
        };
        for target in targets {
            match self.engine.remove_image(&target).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.classify(EntityKind::Image, &target)),
            }
        }
        Ok(RemoveImageResponse {})
    }

    pub async fn image_fs_info(&self, _req: ImageFsInfoRequest) -> Result<ImageFsInfoResponse> {
        let info = self
            .engine
            .info()
            .await
            .map_err(|e| e.classify(EntityKind::Engine, "info"))?;
        let images = self
            .engine
            .list_images()
            .await
            .map_err(|e| e.classify(EntityKind::Image, "list"))?;
        let used: u64 = images.iter().map(|img| img.size.max(0) as u64).sum();

        let usage = FilesystemUsage {
            timestamp: chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0),
            fs_id: Some(FilesystemIdentifier {
                mountpoint: info.root_dir,
            }),
            used_bytes: Some(used),
            inodes_used: None,
        };
        Ok(ImageFsInfoResponse {
            image_filesystems: vec![usage],
        })
    }

    /// Make sure `reference` is present locally, pulling it if needed.
    /// Returns the image id.
    pub async fn ensure_image(&self, reference: &str) -> Result<String> {
        match self.engine.inspect_image(reference).await {
            Ok(image) => return Ok(image.id),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.classify(EntityKind::Image, reference)),
        }
        info!(image = %reference, "Image not present, pulling");
        self.pull(reference, None).await?;
        self.engine
            .inspect_image(reference)
            .await
            .map(|image| image.id)
            .map_err(|e| e.classify(EntityKind::Image, reference))
    }

    /// Drive a pull to completion. The deadline restarts on every progress
    /// event; dropping the stream on expiry cancels the engine-side pull.
    async fn pull(&self, reference: &str, credentials: Option<RegistryCredentials>) -> Result<()> {
        let mut progress = self
            .engine
            .pull_image(reference, credentials)
            .await
            .map_err(|e| e.classify(EntityKind::Image, reference))?;

        loop {
            match tokio::time::timeout(self.pull_deadline, progress.next()).await {
                Err(_) => {
                    warn!(
                        image = %reference,
                        deadline = ?self.pull_deadline,
                        "Image pull made no progress, cancelling"
                    );
                    return Err(ShimError::Stalled {
                        reference: reference.to_string(),
                        deadline: self.pull_deadline,
                    });
                }
                Ok(None) => return Ok(()),
                Ok(Some(Ok(event))) => {
                    debug!(
                        image = %reference,
                        status = %event.status,
                        layer = ?event.layer,
                        progress = ?event.progress,
                        "Pull progress"
                    );
                }
                Ok(Some(Err(e))) => return Err(e.classify(EntityKind::Image, reference)),
            }
        }
    }
}

fn required_reference(spec: Option<ImageSpec>) -> Result<String> {
    spec.map(|s| s.image)
        .filter(|image| !image.is_empty())
        .ok_or_else(|| ShimError::InvalidArgument("image spec required".to_string()))
}

/// Turn CRI auth into engine credentials. A pre-encoded `auth` value
/// (base64 of `user:password`) is used only when no username is given.
pub fn credentials_from_auth(auth: AuthConfig) -> Result<RegistryCredentials> {
    let (username, password) = if auth.username.is_empty() && !auth.auth.is_empty() {
        let decoded = STANDARD
            .decode(auth.auth.trim())
            .map_err(|e| ShimError::InvalidArgument(format!("invalid registry auth: {}", e)))?;
        let decoded = String::from_utf8(decoded)
            .map_err(|_| ShimError::InvalidArgument("invalid registry auth: not UTF-8".to_string()))?;
        let (user, pass) = decoded.split_once(':').ok_or_else(|| {
            ShimError::InvalidArgument("invalid registry auth: expected user:password".to_string())
        })?;
        (user.to_string(), pass.to_string())
    } else {
        (auth.username, auth.password)
    };

    Ok(RegistryCredentials {
        username,
        password,
        server_address: auth.server_address,
        identity_token: auth.identity_token,
        registry_token: auth.registry_token,
    })
}

/// Add the implicit `latest` tag when a reference carries neither tag nor digest.
fn normalize_reference(reference: &str) -> String {
    let last = reference.rsplit('/').next().unwrap_or(reference);
    if last.contains(':') || last.contains('@') {
        reference.to_string()
    } else {
        format!("{}:latest", reference)
    }
}

fn image_matches(id: &str, tags: &[String], digests: &[String], reference: &str) -> bool {
    if id == reference || id.trim_start_matches("sha256:") == reference {
        return true;
    }
    let normalized = normalize_reference(reference);
    tags.iter().any(|t| *t == normalized) || digests.iter().any(|d| d == reference)
}
