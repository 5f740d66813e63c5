use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lettre::message::{Attachment, Mailbox, Message, MultiPart, SinglePart, header::ContentType};
use tracing::{debug, warn};

use mergemail_content::{Branding, LOGO_CID, RowContent, wrap_document};
use mergemail_core::{MergeError, Result};

#[derive(Debug)]
pub struct Asset {
    pub filename: String,
    pub content_type: ContentType,
    pub data: Vec<u8>,
}

/// File bytes read once per run, keyed by path. Unreadable files are
/// remembered as missing so they are not retried for every recipient.
#[derive(Debug, Default)]
pub struct AssetCache {
    assets: HashMap<PathBuf, Option<Arc<Asset>>>,
}

impl AssetCache {
    pub fn load<'a>(paths: impl IntoIterator<Item = &'a Path>) -> (Self, Vec<MergeError>) {
        let mut cache = Self::default();
        let mut errors = Vec::new();
        for path in paths {
            if cache.assets.contains_key(path) {
                continue;
            }
            let entry = match std::fs::read(path) {
                Ok(data) => Some(Arc::new(Asset {
                    filename: path
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_else(|| "attachment".to_string()),
                    content_type: content_type_for(path),
                    data,
                })),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "asset unreadable, omitting");
                    errors.push(MergeError::attachment_read(path, err));
                    None
                }
            };
            cache.assets.insert(path.to_path_buf(), entry);
        }
        (cache, errors)
    }

    pub fn get(&self, path: &Path) -> Option<Arc<Asset>> {
        self.assets.get(path).cloned().flatten()
    }
}

pub fn content_type_for(path: &Path) -> ContentType {
    let guess = mime_guess::from_path(path).first_or_octet_stream();
    ContentType::parse(guess.essence_str())
        .or_else(|_| ContentType::parse("application/octet-stream"))
        .unwrap_or(ContentType::TEXT_PLAIN)
}

#[derive(Debug, Clone, Default)]
pub struct BrandingConfig {
    pub name: Option<String>,
    pub tagline: Option<String>,
    pub logo_path: Option<PathBuf>,
}

/// Builds one `mixed` message per recipient: a `related` part holding the HTML
/// body and its inline images, followed by the file attachments.
pub struct MessageComposer {
    from: Mailbox,
    branding: Branding,
    logo: Option<Arc<Asset>>,
    inline_images: Vec<PathBuf>,
    attachments: Vec<PathBuf>,
    cache: AssetCache,
}

impl MessageComposer {
    pub fn new(
        from: Mailbox,
        branding: &BrandingConfig,
        inline_images: &[PathBuf],
        attachments: &[PathBuf],
    ) -> (Self, Vec<MergeError>) {
        let paths = inline_images
            .iter()
            .chain(attachments.iter())
            .chain(branding.logo_path.iter())
            .map(PathBuf::as_path);
        let (cache, mut errors) = AssetCache::load(paths);

        let logo = branding.logo_path.as_deref().and_then(|p| cache.get(p));
        if branding.logo_path.is_some() && logo.is_none() {
            // A missing logo only loses the branding image.
            errors.retain(|err| {
                !matches!(err, MergeError::AttachmentRead { path, .. } if Some(path.as_path()) == branding.logo_path.as_deref())
            });
            debug!("branding logo unavailable");
        }

        let composer = Self {
            from,
            branding: Branding {
                name: branding.name.clone(),
                tagline: branding.tagline.clone(),
                has_logo: logo.is_some(),
            },
            logo,
            inline_images: inline_images.to_vec(),
            attachments: attachments.to_vec(),
            cache,
        };
        (composer, errors)
    }

    pub fn image_count(&self) -> usize {
        self.inline_images.len()
    }

    pub fn build(&self, to: &str, content: &RowContent) -> Result<Message> {
        let to_addr = to
            .parse()
            .map_err(|e: lettre::address::AddressError| {
                MergeError::RecipientInvalid(format!("{}: {}", to, e))
            })?;
        let html = wrap_document(&content.body.html, &self.branding);

        let mut related = MultiPart::related().singlepart(SinglePart::html(html));
        for inline in &content.body.inline {
            let Some(path) = self.inline_images.get(inline.ordinal.saturating_sub(1)) else {
                continue;
            };
            match self.cache.get(path) {
                Some(asset) => {
                    related = related.singlepart(
                        Attachment::new_inline(inline.cid.clone())
                            .body(asset.data.clone(), asset.content_type.clone()),
                    );
                }
                None => debug!(cid = %inline.cid, "inline image unavailable"),
            }
        }
        if let Some(logo) = &self.logo {
            related = related.singlepart(
                Attachment::new_inline(LOGO_CID.to_string())
                    .body(logo.data.clone(), logo.content_type.clone()),
            );
        }

        let mut mixed = MultiPart::mixed().multipart(related);
        for path in &self.attachments {
            if let Some(asset) = self.cache.get(path) {
                mixed = mixed.singlepart(
                    Attachment::new(asset.filename.clone())
                        .body(asset.data.clone(), asset.content_type.clone()),
                );
            }
        }

        Message::builder()
            .from(self.from.clone())
            .to(Mailbox::new(None, to_addr))
            .subject(content.subject.clone())
            .multipart(mixed)
            .map_err(|e| MergeError::Delivery(e.to_string()))
    }
}
