//! External data adapter contract (spec §6). Each adapter (issues, change
//! reviews, web pages, mailing lists, async tasks) owns one dedicated kind
//! in the timed index; the core never inspects what it writes there. No
//! concrete adapter ships with this crate — this defines the seam so
//! `oscar-timed`'s own tests, and an embedding process, can drive one.

use async_trait::async_trait;
use oscar_base::Result;
use oscar_kv::Kv;

use crate::timed::TimedIndex;

/// One embeddable unit projected out of a synced record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub id: String,
    pub title: String,
    pub text: String,
}

#[async_trait]
pub trait Adapter<K: Kv>: Send + Sync {
    /// The dedicated kind this adapter writes into, e.g. `"github.Issue"`.
    fn kind(&self) -> &str;

    /// Writes new/updated records as timed entries of `kind()`.
    async fn sync(&self, timed: &TimedIndex<K>) -> Result<()>;

    /// Projects zero or more embeddable `(id, title, text)` documents out
    /// of one synced record. The core does not inspect record contents —
    /// only the adapter that wrote a kind knows how to read it back.
    fn documents(&self, data_key: &[u8], value: &[u8]) -> Vec<Document>;
}
