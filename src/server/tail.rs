//! Log tail-following (spec.md §4.6's `tail_follow`): streams newly
//! appended lines of a growing file to a connected client, polling for
//! growth rather than using inotify, matching the Python original's
//! poll-and-seek loop.

use std::path::PathBuf;

use anyhow::Result;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio::time::{sleep, Duration};

pub struct TailFollower {
    path: PathBuf,
    position: u64,
    poll_interval: Duration,
}

impl TailFollower {
    pub fn new(path: PathBuf, poll_interval: Duration) -> Self {
        TailFollower { path, position: 0, poll_interval }
    }

    /// Starting at the end of the file as it currently exists, so a newly
    /// attached client only sees output produced after it connected.
    pub async fn from_current_end(path: PathBuf, poll_interval: Duration) -> Result<Self> {
        let position = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
        Ok(TailFollower { path, position, poll_interval })
    }

    /// Blocks until new bytes are available, then returns them as a
    /// UTF-8-lossy string. Returns `None` if the file was truncated or
    /// removed out from under the follower (treated as end of stream).
    pub async fn next_chunk(&mut self) -> Result<Option<String>> {
        loop {
            let mut file = match File::open(&self.path).await {
                Ok(f) => f,
                Err(_) => return Ok(None),
            };
            let len = file.metadata().await?.len();

            if len < self.position {
                // truncated/rotated underneath us
                return Ok(None);
            }
            if len == self.position {
                sleep(self.poll_interval).await;
                continue;
            }

            file.seek(SeekFrom::Start(self.position)).await?;
            let mut buf = vec![0u8; (len - self.position) as usize];
            file.read_exact(&mut buf).await?;
            self.position = len;
            return Ok(Some(String::from_utf8_lossy(&buf).into_owned()));
        }
    }
}
