/*!
Helpers pour tests async

- init_logging : env_logger en mode test, idempotent
- recv_within  : réception bornée dans le temps (files mpsc bornées ou non)
- wait_until   : attente active d'une condition
*/

use anyhow::Result;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Init logging pour tests (RUST_LOG), sans effet si déjà fait
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Réception côté test, commune aux deux sortes de files mpsc
pub trait Inbox {
    type Item;
    fn next_item(&mut self) -> impl Future<Output = Option<Self::Item>> + '_;
}

impl<T> Inbox for mpsc::Receiver<T> {
    type Item = T;
    fn next_item(&mut self) -> impl Future<Output = Option<T>> + '_ {
        self.recv()
    }
}

impl<T> Inbox for mpsc::UnboundedReceiver<T> {
    type Item = T;
    fn next_item(&mut self) -> impl Future<Output = Option<T>> + '_ {
        self.recv()
    }
}

/// Attend le prochain élément d'un canal pendant au plus `limit`
pub async fn recv_within<R: Inbox>(rx: &mut R, limit: Duration) -> Result<R::Item> {
    match timeout(limit, rx.next_item()).await {
        Ok(Some(item)) => Ok(item),
        Ok(None) => anyhow::bail!("channel closed"),
        Err(_) => anyhow::bail!("nothing received within {:?}", limit),
    }
}

/// Réévalue `check` toutes les 20 ms jusqu'à ce qu'elle soit vraie ou que `limit` expire
pub async fn wait_until<F, Fut>(limit: Duration, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = std::time::Instant::now();
    while start.elapsed() < limit {
        if check().await {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    log::warn!("condition not met within {:?}", limit);
    anyhow::bail!("condition not met within {:?}", limit)
}
