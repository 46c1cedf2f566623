use std::path::{Path, PathBuf};

use log::{debug, info};
use rand::Rng;
use tokio::fs;

use crate::archive;
use crate::error::{Error, Result};
use crate::messages::{decode_msg, encode_msg, Answer, Offer, TransitMsg, ZIPFILE_DEFLATED};
use crate::pipeline;
use crate::transit::{establish, Role, TransitOptions};
use crate::wormhole::EncryptedConnection;

/// What a completed receive produced.
#[derive(Debug, PartialEq)]
pub enum Received {
    File(PathBuf),
    Directory(PathBuf),
    Message(String),
}

/// Send a file or directory to the peer.
///
/// Negotiates the transit connection, then offers the path: a directory is
/// packed into a deflated zip and offered with its file count and byte
/// total, a regular file is offered as-is. Once the peer acks the offer,
/// the bytes stream through the record pipeline. Returns the confirmed
/// SHA-256 digest of the transferred bytes.
pub async fn send<C: EncryptedConnection>(
    conn: &mut C,
    appid: &str,
    options: &TransitOptions,
    path: &Path,
) -> Result<String> {
    let metadata = fs::metadata(path).await?;
    let transit = establish(conn, appid, Role::Sender, options).await?;

    let (offer, source_path, staged_zip) = if metadata.is_dir() {
        debug!("packing directory {}", path.display());
        let zipped = archive::zip_dir(path)?;
        let zipsize = fs::metadata(&zipped.path).await?.len();
        let offer = Offer::Directory {
            mode: ZIPFILE_DEFLATED.into(),
            dirname: local_basename(path)?,
            zipsize,
            numbytes: zipped.total_bytes,
            numfiles: zipped.num_files,
        };
        (offer, zipped.path.clone(), Some(zipped.path))
    } else {
        let offer = Offer::File {
            filename: local_basename(path)?,
            filesize: metadata.len(),
        };
        (offer, path.to_path_buf(), None)
    };

    send_offer(conn, &offer).await?;

    let source = fs::File::open(&source_path).await?;
    let result = pipeline::send_records(transit, source).await;
    if let Some(staged) = staged_zip {
        let _ = fs::remove_file(staged).await;
    }
    let digest = result?;
    info!("sent {} ({} confirmed)", path.display(), digest);
    Ok(digest)
}

/// Receive whatever the peer offers into `dest_dir`.
///
/// A file lands under its offered basename; a directory offer streams a zip
/// through the pipeline and unpacks it into `dest_dir/<dirname>` with file
/// modes restored; a message offer is acked and returned without touching
/// the filesystem.
pub async fn receive<C: EncryptedConnection>(
    conn: &mut C,
    appid: &str,
    options: &TransitOptions,
    dest_dir: &Path,
) -> Result<Received> {
    let transit = establish(conn, appid, Role::Receiver, options).await?;

    let raw = conn.receive_plain().await?;
    let offer: Offer = match serde_json::from_slice(&raw) {
        Ok(offer) => offer,
        Err(schema_err) => match decode_msg(&raw) {
            Ok(TransitMsg::Error(text)) => {
                return Err(Error::UnexpectedMessage(format!("peer error: {}", text)))
            }
            Ok(other) => {
                return Err(Error::UnexpectedMessage(format!(
                    "awaiting offer, got {:?}",
                    other
                )))
            }
            Err(_) => return Err(Error::Schema(schema_err)),
        },
    };

    let answer = match &offer {
        Offer::Message(_) => Answer::MessageAck("ok".into()),
        _ => Answer::FileAck("ok".into()),
    };
    conn.send_plain(&encode_msg(&TransitMsg::Answer(answer))?).await?;

    match offer {
        Offer::Message(text) => Ok(Received::Message(text)),
        Offer::File { filename, filesize } => {
            let dest = dest_dir.join(offered_basename(&filename)?);
            let digest = pipeline::receive_records(transit, filesize, &dest).await?;
            info!("received {} ({} confirmed)", dest.display(), digest);
            Ok(Received::File(dest))
        }
        Offer::Directory {
            mode,
            dirname,
            zipsize,
            ..
        } => {
            if mode != ZIPFILE_DEFLATED {
                return Err(Error::UnexpectedMessage(format!(
                    "unsupported directory mode {:?}",
                    mode
                )));
            }
            let name = offered_basename(&dirname)?;

            let suffix: u32 = rand::thread_rng().gen();
            let zip_path = std::env::temp_dir().join(format!("portal-recv-{:08x}.zip", suffix));
            let digest = pipeline::receive_records(transit, zipsize, &zip_path).await?;

            let dest = dest_dir.join(name);
            let unpacked = archive::unzip_into(&dest, &zip_path);
            let _ = fs::remove_file(&zip_path).await;
            unpacked?;

            info!("received {} ({} confirmed)", dest.display(), digest);
            Ok(Received::Directory(dest))
        }
    }
}

async fn send_offer<C: EncryptedConnection>(conn: &mut C, offer: &Offer) -> Result<()> {
    conn.send_plain(&serde_json::to_vec(offer)?).await?;
    match decode_msg(&conn.receive_plain().await?)? {
        TransitMsg::Answer(Answer::FileAck(ack)) if ack == "ok" => Ok(()),
        TransitMsg::Error(text) => Err(Error::UnexpectedMessage(format!(
            "peer error: {}",
            text
        ))),
        other => Err(Error::UnexpectedMessage(format!(
            "awaiting file_ack, got {:?}",
            other
        ))),
    }
}

fn local_basename(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_owned)
        .ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} has no usable basename", path.display()),
            ))
        })
}

/// Reduce an offered name to its final path component. Offers come from the
/// peer, so anything that could climb out of the destination directory is
/// rejected.
fn offered_basename(name: &str) -> Result<String> {
    match Path::new(name).file_name().and_then(|n| n.to_str()) {
        Some(base) => Ok(base.to_owned()),
        None => Err(Error::UnexpectedMessage(format!(
            "unusable name in offer: {:?}",
            name
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offered_basename_strips_directories() {
        assert_eq!(offered_basename("report.pdf").unwrap(), "report.pdf");
        assert_eq!(offered_basename("a/b/report.pdf").unwrap(), "report.pdf");
        assert_eq!(offered_basename("/etc/passwd").unwrap(), "passwd");
    }

    #[test]
    fn test_offered_basename_rejects_traversal() {
        assert!(offered_basename("..").is_err());
        assert!(offered_basename("").is_err());
    }

    #[test]
    fn test_local_basename() {
        assert_eq!(
            local_basename(Path::new("/home/user/photo.jpg")).unwrap(),
            "photo.jpg"
        );
        assert!(local_basename(Path::new("/")).is_err());
    }
}
