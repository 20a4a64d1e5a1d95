use crate::{container::Runtime, errors::RuntimeError};
use std::{io, time::Duration};
use tokio::{
    fs,
    io::{AsyncWrite, AsyncWriteExt},
};

const FOLLOW_POLL_INTERVAL: Duration = Duration::from_millis(100);

impl Runtime {
    /// Copy a container's log to `out`
    ///
    /// With `follow`, keeps polling for appended output and copies only the
    /// new bytes, until the container's directory goes away. That ends the
    /// copy with [RuntimeError::ContainerRemoved].
    pub async fn logs<W>(&self, id: &str, follow: bool, out: &mut W) -> Result<(), RuntimeError>
    where
        W: AsyncWrite + Unpin,
    {
        let record = self.inspect(id)?;
        let path = self.store.log_path(&record.id);
        let mut file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(RuntimeError::LogNotFound(record.id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let mut offset = tokio::io::copy(&mut file, out).await?;
        out.flush().await?;
        if !follow {
            return Ok(());
        }

        let dir = self.store.container_dir(&record.id);
        log::debug!("following {:?} from offset {}", path, offset);
        loop {
            tokio::time::delay_for(FOLLOW_POLL_INTERVAL).await;
            let copied = tokio::io::copy(&mut file, out).await?;
            if copied > 0 {
                offset += copied;
                out.flush().await?;
                log::trace!("log offset now {}", offset);
            }
            if fs::metadata(&dir).await.is_err() {
                return Err(RuntimeError::ContainerRemoved(record.id.to_string()));
            }
        }
    }
}
