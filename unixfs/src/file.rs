use crate::pb::{UnixFsReadFailed, UnixFsType};
use std::borrow::Cow;
use std::fmt;

/// Errors which can happen while decoding a block as a UnixFS file or raw node.
#[derive(Debug)]
pub enum FileReadFailed {
    /// Unsupported UnixFs node shape.
    File(FileError),
    /// A node decoded but its `Type` was neither `File` nor `Raw`.
    UnexpectedType(i32),
    /// Protobuf framing failed.
    Read(UnixFsReadFailed),
    /// A link's `Hash` field did not decode as a valid CID.
    LinkInvalidCid {
        nth: usize,
        hash: Vec<u8>,
        name: Cow<'static, str>,
        cause: cid::Error,
    },
}

impl fmt::Display for FileReadFailed {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        use FileReadFailed::*;

        match self {
            File(e) => write!(fmt, "{}", e),
            UnexpectedType(t) => write!(
                fmt,
                "unexpected type for UnixFs: {} or {:?}",
                t,
                UnixFsType::from(*t)
            ),
            Read(e) => write!(fmt, "reading failed: {}", e),
            LinkInvalidCid {
                nth, name, cause, ..
            } => write!(
                fmt,
                "failed to convert link #{} ({:?}) to Cid: {}",
                nth, name, cause
            ),
        }
    }
}

impl std::error::Error for FileReadFailed {}

impl From<UnixFsReadFailed> for FileReadFailed {
    fn from(e: UnixFsReadFailed) -> Self {
        FileReadFailed::Read(e)
    }
}

/// Errors which can happen while interpreting a decoded `File`/`Raw` node's fields.
#[derive(Debug)]
pub enum FileError {
    /// Nonequal number of links and blocksizes: subtree ranges cannot be determined.
    LinksAndBlocksizesMismatch,
    /// `filesize` is non-zero while there is no content and no links.
    NoLinksNoContent,
    /// A non-leaf node in the tree has no `filesize`, which is required to size its subtree.
    IntermediateNodeWithoutFileSize,
    /// `hashType`/`fanout` are unsupported for `File`/`Raw` nodes (they belong to `HAMTShard`).
    UnexpectedRawOrFileProperties {
        hash_type: Option<u64>,
        fanout: Option<u64>,
    },
}

impl fmt::Display for FileError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        use FileError::*;
        match self {
            LinksAndBlocksizesMismatch => write!(
                fmt,
                "different number of links and blocksizes: cannot determine subtree ranges"
            ),
            NoLinksNoContent => write!(
                fmt,
                "filesize is non-zero while there are no links or content"
            ),
            IntermediateNodeWithoutFileSize => {
                write!(fmt, "intermediate node with links but no filesize")
            }
            UnexpectedRawOrFileProperties { hash_type, fanout } => write!(
                fmt,
                "unsupported: File or Raw with hash_type {:?} or fanout {:?}",
                hash_type, fanout
            ),
        }
    }
}

impl std::error::Error for FileError {}

impl From<FileError> for FileReadFailed {
    fn from(e: FileError) -> Self {
        Self::File(e)
    }
}

/// Validates a decoded `File`/`Raw` node's structural invariants: link/blocksize counts line up,
/// content is present when `filesize` says it should be, and no `HAMTShard`-only fields leaked in.
/// Returns the node's inline content slice (empty for intermediate nodes).
pub fn validate_file_or_raw<'a>(
    inner: &crate::pb::FlatUnixFs<'a>,
) -> Result<&'a [u8], FileReadFailed> {
    let data = &inner.data;

    if data.Type != UnixFsType::File && data.Type != UnixFsType::Raw {
        return Err(FileReadFailed::UnexpectedType(i32::from(data.Type)));
    }

    if inner.links.len() != data.blocksizes.len() {
        return Err(FileError::LinksAndBlocksizesMismatch.into());
    }

    let content: &'a [u8] = match data.Data {
        Some(Cow::Borrowed(bytes)) => bytes,
        Some(Cow::Owned(_)) => unreachable!("decoded Data is always borrowed from the block"),
        None => &[][..],
    };

    let is_zero_bytes = data.filesize.unwrap_or(0) == 0;
    if content.is_empty() && !is_zero_bytes && inner.links.is_empty() {
        return Err(FileError::NoLinksNoContent.into());
    }

    if data.hashType.is_some() || data.fanout.is_some() {
        return Err(FileError::UnexpectedRawOrFileProperties {
            hash_type: data.hashType,
            fanout: data.fanout,
        }
        .into());
    }

    if !inner.links.is_empty() && data.filesize.is_none() {
        return Err(FileError::IntermediateNodeWithoutFileSize.into());
    }

    Ok(content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pb::FlatUnixFs;
    use std::convert::TryFrom;

    const CONTENT_FILE: &[u8] = &[
        0x0a, 0x0d, 0x08, 0x02, 0x12, 0x07, 0x63, 0x6f, 0x6e, 0x74, 0x65, 0x6e, 0x74, 0x18, 0x07,
    ];

    #[test]
    fn just_content() {
        let node = FlatUnixFs::try_from(CONTENT_FILE).unwrap();
        let content = validate_file_or_raw(&node).unwrap();
        assert_eq!(content, b"content");
    }

    #[test]
    fn empty_file() {
        let block = &[0x0a, 0x04, 0x08, 0x02, 0x18, 0x00];
        let node = FlatUnixFs::try_from(block.as_slice()).unwrap();
        let content = validate_file_or_raw(&node).unwrap();
        assert_eq!(content, &[][..]);
    }
}
