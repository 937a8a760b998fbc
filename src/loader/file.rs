//! The local-filesystem loader. Deliberately minimal: it is registered so `file://` URLs dispatch
//! somewhere, not because this transport deserves a state machine.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::model::{ErrorMessage, ResultBundle, Url};
use crate::status::StatusSender;

use super::Loader;

pub struct FileLoader;

#[async_trait]
impl Loader for FileLoader {
    async fn load_async(
        &self,
        url: &Url,
        status: StatusSender,
        _cancel: Option<CancellationToken>,
    ) -> Result<ResultBundle, ErrorMessage> {
        let _ = status.send(Ok(crate::model::ProgressTag("reading")));

        let bytes = tokio::fs::read(&url.path)
            .await
            .map_err(|e| ErrorMessage::new("file", e.to_string()))?;

        let _ = status.send(Ok(crate::model::ProgressTag("completed")));
        Ok(ResultBundle::single(url.basename(), bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::status_channel;

    #[tokio::test]
    async fn reads_an_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        std::fs::write(&path, b"hi").unwrap();

        let url = Url::parse(&format!("file://{}", path.display())).unwrap();
        let (tx, _rx) = status_channel();
        let bundle = FileLoader.load_async(&url, tx, None).await.unwrap();

        assert_eq!(bundle.names, vec!["hello.txt"]);
        assert_eq!(bundle.contents[0], b"hi");
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let url = Url::parse("file:///does/not/exist").unwrap();
        let (tx, _rx) = status_channel();
        assert!(FileLoader.load_async(&url, tx, None).await.is_err());
    }
}
