use std::fmt;
use std::sync::Arc;

use ethereum_types::{Address, Bloom, BloomInput, H256};
use keccak_hash::keccak;
use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};
use rollup_common::ZERO_HASH;

/// An EVM log record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Log {
    pub address: Address,
    pub topics: Vec<H256>,
    pub data: Vec<u8>,
}

impl Log {
    pub fn accrue_bloom(&self, bloom: &mut Bloom) {
        bloom.accrue(BloomInput::Raw(self.address.as_bytes()));
        for topic in &self.topics {
            bloom.accrue(BloomInput::Raw(topic.as_bytes()));
        }
    }
}

impl Encodable for Log {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(3);
        s.append(&self.address);
        s.append_list::<H256, _>(&self.topics);
        s.append(&self.data);
    }
}

impl Decodable for Log {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        if rlp.item_count()? != 3 {
            return Err(DecoderError::RlpIncorrectListLen);
        }
        Ok(Self {
            address: rlp.val_at(0)?,
            topics: rlp.list_at(1)?,
            data: rlp.val_at(2)?,
        })
    }
}

struct LogNode {
    log: Log,
    hash: H256,
    len: usize,
    prev: Option<Arc<LogNode>>,
}

/// The logs emitted so far in a transaction, as a persistent hash chain.
///
/// Appending never mutates an existing series, so a snapshot taken before a
/// nested call stays valid when the call reverts. The empty series commits to
/// [`ZERO_HASH`] however it was obtained.
#[derive(Clone, Default)]
pub struct LogSeries {
    head: Option<Arc<LogNode>>,
}

impl LogSeries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_logs(logs: impl IntoIterator<Item = Log>) -> Self {
        logs.into_iter()
            .fold(Self::new(), |series, log| series.append(log))
    }

    pub fn hash(&self) -> H256 {
        self.head.as_ref().map_or(ZERO_HASH, |node| node.hash)
    }

    pub fn len(&self) -> usize {
        self.head.as_ref().map_or(0, |node| node.len)
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    #[must_use]
    pub fn append(&self, log: Log) -> Self {
        let mut link = RlpStream::new_list(2);
        link.append(&self.hash());
        link.append(&keccak(rlp::encode(&log)));
        let node = LogNode {
            hash: keccak(link.out()),
            len: self.len() + 1,
            log,
            prev: self.head.clone(),
        };
        Self {
            head: Some(Arc::new(node)),
        }
    }

    /// The logs in emission order.
    pub fn logs(&self) -> Vec<Log> {
        let mut logs = Vec::with_capacity(self.len());
        let mut cursor = self.head.as_deref();
        while let Some(node) = cursor {
            logs.push(node.log.clone());
            cursor = node.prev.as_deref();
        }
        logs.reverse();
        logs
    }

    pub fn bloom(&self) -> Bloom {
        let mut bloom = Bloom::zero();
        for log in self.logs() {
            log.accrue_bloom(&mut bloom);
        }
        bloom
    }
}

impl PartialEq for LogSeries {
    fn eq(&self, other: &Self) -> bool {
        self.hash() == other.hash()
    }
}

impl Eq for LogSeries {}

impl fmt::Debug for LogSeries {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogSeries")
            .field("len", &self.len())
            .field("hash", &self.hash())
            .finish()
    }
}

impl Encodable for LogSeries {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.append_list::<Log, _>(&self.logs());
    }
}

impl Decodable for LogSeries {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        Ok(Self::from_logs(rlp.as_list::<Log>()?))
    }
}
