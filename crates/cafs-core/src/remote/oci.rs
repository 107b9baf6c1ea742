use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use oci_distribution::client::{Client, ClientConfig, ClientProtocol, Config, ImageLayer};
use oci_distribution::manifest::{
    OciDescriptor, OciImageManifest, OciManifest, IMAGE_CONFIG_MEDIA_TYPE,
};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Reference, RegistryOperation};
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::compression;
use crate::digest::Digest;
use crate::layer;
use crate::shard::PrefixInfo;

use super::plan::{self, BuiltLayer};
use super::retry::with_retry;
use super::{Authenticator, PullOutcome, PushOutcome, PushRequest, Remote};

/// Media type declared for packed layers.
const LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+zstd";

/// Config label carrying the root index digest.
const ROOT_LABEL: &str = "dev.cafs.root";

/// Config label carrying the shard→{hash, layer} map.
const PREFIXES_LABEL: &str = "dev.cafs.prefixes";

/// Registry transport: store state rides in container images whose config
/// labels describe the root and shard layout, and whose layers are packed
/// shard groups.
///
/// Layer uploads and downloads run on a bounded worker pool; every network
/// primitive is retried with backoff.
pub struct OciRemote {
    registry: String,
    repository: String,
    tag: String,
    auth: Arc<dyn Authenticator>,
    concurrency: usize,
}

impl OciRemote {
    pub fn new(
        registry: String,
        repository: String,
        tag: String,
        auth: Arc<dyn Authenticator>,
        concurrency: usize,
    ) -> Self {
        Self {
            registry,
            repository,
            tag,
            auth,
            concurrency: concurrency.max(1),
        }
    }

    fn client(&self) -> Client {
        let mut config = ClientConfig::default();
        if self.registry.starts_with("localhost") || self.registry.starts_with("127.0.0.1") {
            config.protocol = ClientProtocol::HttpsExcept(vec![self.registry.clone()]);
        }
        Client::new(config)
    }

    fn registry_auth(&self) -> Result<RegistryAuth> {
        Ok(match self.auth.authenticate(&self.registry)? {
            Some((username, password)) => RegistryAuth::Basic(username, password),
            None => RegistryAuth::Anonymous,
        })
    }

    fn reference(&self, tag: &str) -> Reference {
        Reference::with_tag(
            self.registry.clone(),
            self.repository.clone(),
            tag.to_string(),
        )
    }

    async fn authenticate(
        &self,
        client: &Arc<Client>,
        reference: &Reference,
        operation: RegistryOperation,
    ) -> Result<()> {
        with_retry("registry auth", || {
            let client = Arc::clone(client);
            let reference = reference.clone();
            let auth = self.registry_auth();
            let operation = operation.clone();
            async move {
                client
                    .auth(&reference, &auth?, operation)
                    .await
                    .map(|_| ())
                    .map_err(anyhow::Error::from)
            }
        })
        .await
    }

    async fn push_tag(
        &self,
        client: Arc<Client>,
        tag: &str,
        layers: Arc<Vec<BuiltLayer>>,
        config_bytes: &[u8],
    ) -> Result<()> {
        let reference = self.reference(tag);
        self.authenticate(&client, &reference, RegistryOperation::Push)
            .await?;

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut uploads = JoinSet::new();
        for built in layers.iter() {
            let semaphore = Arc::clone(&semaphore);
            let client = Arc::clone(&client);
            let reference = reference.clone();
            let data = Arc::new(built.compressed.clone());
            let digest = built.digest.clone();
            let shards = built.shards.len();
            uploads.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .context("upload pool closed")?;
                debug!(layer = %digest, shards, "uploading layer");
                with_retry("layer upload", || {
                    let client = Arc::clone(&client);
                    let reference = reference.clone();
                    let data = Arc::clone(&data);
                    let digest = digest.clone();
                    async move {
                        client
                            .push_blob(&reference, data.as_slice(), &digest)
                            .await
                            .map(|_| ())
                            .map_err(anyhow::Error::from)
                    }
                })
                .await
            });
        }
        while let Some(joined) = uploads.join_next().await {
            joined.context("layer upload task failed")??;
        }

        let config_digest = Digest::from_bytes(config_bytes).to_string();
        with_retry("config upload", || {
            let client = Arc::clone(&client);
            let reference = reference.clone();
            let data = config_bytes.to_vec();
            let digest = config_digest.clone();
            async move {
                client
                    .push_blob(&reference, data.as_slice(), &digest)
                    .await
                    .map(|_| ())
                    .map_err(anyhow::Error::from)
            }
        })
        .await?;

        let image_layers: Vec<ImageLayer> = layers
            .iter()
            .map(|built| {
                ImageLayer::new(built.compressed.clone(), LAYER_MEDIA_TYPE.to_string(), None)
            })
            .collect();
        let config = Config::new(
            config_bytes.to_vec(),
            IMAGE_CONFIG_MEDIA_TYPE.to_string(),
            None,
        );
        let manifest = OciImageManifest::build(&image_layers, &config, None);
        with_retry("manifest push", || {
            let client = Arc::clone(&client);
            let reference = reference.clone();
            let manifest = manifest.clone();
            async move {
                client
                    .push_manifest(&reference, &OciManifest::Image(manifest))
                    .await
                    .map(|_| ())
                    .map_err(anyhow::Error::from)
            }
        })
        .await?;
        Ok(())
    }

    async fn push_all(
        &self,
        tags: &[String],
        layers: Arc<Vec<BuiltLayer>>,
        config_bytes: Vec<u8>,
    ) -> Result<()> {
        let client = Arc::new(self.client());
        for tag in tags {
            self.push_tag(Arc::clone(&client), tag, Arc::clone(&layers), &config_bytes)
                .await
                .with_context(|| {
                    format!("failed to push {}/{}:{tag}", self.registry, self.repository)
                })?;
            info!(
                reference = %self.reference(tag),
                layers = layers.len(),
                "pushed image"
            );
        }
        Ok(())
    }

    async fn pull_remote(
        &self,
        local_prefixes: &BTreeMap<String, PrefixInfo>,
    ) -> Result<PullOutcome> {
        let client = Arc::new(self.client());
        let reference = self.reference(&self.tag);
        self.authenticate(&client, &reference, RegistryOperation::Pull)
            .await?;

        let config_json = with_retry("manifest fetch", || {
            let client = Arc::clone(&client);
            let reference = reference.clone();
            let auth = self.registry_auth();
            async move {
                let (_manifest, _digest, config) = client
                    .pull_manifest_and_config(&reference, &auth?)
                    .await
                    .map_err(anyhow::Error::from)?;
                Ok(config)
            }
        })
        .await?;

        let (root, prefixes) = parse_image_config(&config_json)?;
        let needed = plan::needed_layers(&prefixes, local_prefixes);
        debug!(
            reference = %reference,
            shards = prefixes.len(),
            layers_needed = needed.len(),
            "pull planned"
        );

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut downloads = JoinSet::new();
        for layer_digest in needed.into_keys() {
            let semaphore = Arc::clone(&semaphore);
            let client = Arc::clone(&client);
            let reference = reference.clone();
            downloads.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .context("download pool closed")?;
                let compressed = with_retry("layer fetch", || {
                    let client = Arc::clone(&client);
                    let reference = reference.clone();
                    let layer_digest = layer_digest.clone();
                    async move {
                        let descriptor = OciDescriptor {
                            media_type: LAYER_MEDIA_TYPE.to_string(),
                            digest: layer_digest,
                            ..Default::default()
                        };
                        let mut data = Vec::new();
                        client
                            .pull_blob(&reference, &descriptor, &mut data)
                            .await
                            .map_err(anyhow::Error::from)?;
                        Ok(data)
                    }
                })
                .await?;
                let packed = compression::decompress_layer(&compressed)?;
                layer::unpack(&packed)
            });
        }

        let mut objects = BTreeMap::new();
        while let Some(joined) = downloads.join_next().await {
            let blobs = joined.context("layer fetch task failed")??;
            objects.extend(blobs);
        }

        Ok(PullOutcome {
            root,
            objects,
            prefixes,
        })
    }
}

impl Remote for OciRemote {
    fn push(&self, request: PushRequest) -> Result<PushOutcome> {
        let (layers, prefixes) =
            plan::build_push_layers(&request.objects, &request.local_prefixes)?;
        let config_bytes = build_image_config(&request.root, &prefixes, &layers)?;
        let tags = if request.tags.is_empty() {
            vec![self.tag.clone()]
        } else {
            request.tags.clone()
        };
        let layers_uploaded = layers.len();
        let layers = Arc::new(layers);

        let runtime =
            tokio::runtime::Runtime::new().context("failed to initialize registry runtime")?;
        runtime.block_on(self.push_all(&tags, layers, config_bytes))?;

        Ok(PushOutcome {
            prefixes,
            layers_uploaded,
        })
    }

    fn pull(&self, local_prefixes: &BTreeMap<String, PrefixInfo>) -> Result<PullOutcome> {
        let runtime =
            tokio::runtime::Runtime::new().context("failed to initialize registry runtime")?;
        runtime.block_on(self.pull_remote(local_prefixes))
    }
}

/// Image config JSON: standard rootfs/diff_ids plus the cafs labels.
fn build_image_config(
    root: &Digest,
    prefixes: &BTreeMap<String, PrefixInfo>,
    layers: &[BuiltLayer],
) -> Result<Vec<u8>> {
    let diff_ids: Vec<String> = layers
        .iter()
        .map(|built| Digest::from_bytes(&built.packed).to_string())
        .collect();
    let config = json!({
        "architecture": "amd64",
        "os": "linux",
        "rootfs": {
            "type": "layers",
            "diff_ids": diff_ids,
        },
        "config": {
            "Labels": {
                ROOT_LABEL: root.as_str(),
                PREFIXES_LABEL: serde_json::to_string(prefixes)
                    .context("failed to encode prefix label")?,
            },
        },
    });
    serde_json::to_vec(&config).context("failed to encode image config")
}

/// Read the cafs labels back out of an image config document.
fn parse_image_config(config_json: &str) -> Result<(Digest, BTreeMap<String, PrefixInfo>)> {
    let config: serde_json::Value =
        serde_json::from_str(config_json).context("failed to parse image config")?;
    let labels = &config["config"]["Labels"];
    let root = labels[ROOT_LABEL]
        .as_str()
        .ok_or_else(|| anyhow!("image is missing the {ROOT_LABEL} label"))?;
    let root = Digest::parse(root)?;
    let prefixes = match labels[PREFIXES_LABEL].as_str() {
        Some(raw) => serde_json::from_str(raw)
            .with_context(|| format!("failed to parse the {PREFIXES_LABEL} label"))?,
        None => BTreeMap::new(),
    };
    Ok((root, prefixes))
}
