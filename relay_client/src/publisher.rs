use {
    crate::{connection::RelayConnection, Result},
    relay_rpc::{
        domain::Topic,
        rpc::{params::IrnMetadata, Params, Publish},
    },
    std::sync::Arc,
    tracing::debug,
};

/// Default time the relay keeps a published message, in seconds.
pub const DEFAULT_PUBLISH_TTL: u32 = 6 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOptions {
    pub ttl: u32,
    pub tag: u32,
    pub prompt: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_PUBLISH_TTL,
            tag: 0,
            prompt: false,
        }
    }
}

impl From<IrnMetadata> for PublishOptions {
    fn from(metadata: IrnMetadata) -> Self {
        Self {
            ttl: u32::try_from(metadata.ttl).unwrap_or(u32::MAX),
            tag: metadata.tag,
            prompt: metadata.prompt,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Publisher {
    connection: Arc<RelayConnection>,
}

impl Publisher {
    pub(crate) fn new(connection: Arc<RelayConnection>) -> Self {
        Self { connection }
    }

    pub async fn publish(
        &self,
        topic: &Topic,
        message: impl Into<Arc<str>>,
        options: PublishOptions,
    ) -> Result<()> {
        self.connection
            .request(Params::Publish(Publish {
                topic: topic.clone(),
                message: message.into(),
                ttl_secs: options.ttl,
                tag: options.tag,
                prompt: options.prompt,
            }))
            .await?;

        debug!(%topic, tag = options.tag, "published");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_from_irn_metadata() {
        assert_eq!(PublishOptions::default().ttl, 21600);

        let options = PublishOptions::from(IrnMetadata {
            tag: 1108,
            ttl: 300,
            prompt: true,
        });
        assert_eq!(options, PublishOptions {
            ttl: 300,
            tag: 1108,
            prompt: true,
        });
    }
}
