//! Consensus state persistence: the write-batch builder and the view-change
//! snapshot records.

use parity_scale_codec::{Decode, Encode};
use std::sync::Arc;
use tracing::trace;
use umbra_api::{KvStore, WriteOp};
use umbra_types::codec;
use umbra_types::error::StorageError;

use crate::instance::PbftVcInstance;
use crate::message::{PbftEnv, PbftPreparedSet, PbftViewChange};

/// Collects consensus writes in one scope and commits them atomically at the
/// end of it. Dropping an uncommitted saver flushes it as well, so every exit
/// path persists what it staged.
pub struct ValueSaver {
    store: Arc<dyn KvStore>,
    ops: Vec<WriteOp>,
}

impl ValueSaver {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        ValueSaver {
            store,
            ops: Vec::new(),
        }
    }

    pub fn save_value<T: Encode>(&mut self, key: &str, value: &T) {
        trace!(target: "consensus", "staging write of {}", key);
        self.ops.push(WriteOp::Put {
            key: key.to_string(),
            value: codec::to_bytes_canonical(value),
        });
    }

    pub fn del_value(&mut self, key: &str) {
        self.ops.push(WriteOp::Delete {
            key: key.to_string(),
        });
    }

    /// Commit all staged writes. A saver that staged nothing is a no-op.
    pub fn commit(&mut self) -> Result<(), StorageError> {
        if self.ops.is_empty() {
            return Ok(());
        }
        let ops = std::mem::take(&mut self.ops);
        self.store.write_batch(ops)
    }
}

impl Drop for ValueSaver {
    fn drop(&mut self) {
        let _ = self.commit();
    }
}

/// Reads and decodes a persisted consensus value.
pub fn load_value<T: Decode>(store: &dyn KvStore, key: &str) -> Result<Option<T>, StorageError> {
    match store.get(key)? {
        None => Ok(None),
        Some(bytes) => codec::from_bytes_canonical(&bytes)
            .map(Some)
            .map_err(StorageError::Decode),
    }
}

/// Snapshot form of one view-change instance.
#[derive(Debug, Clone, Encode, Decode)]
pub struct VcInstanceRecord {
    pub view_number: i64,
    pub sequence: i64,
    pub view_change_round: u32,
    pub start_time: i64,
    pub end_time: i64,
    pub last_propose_time: i64,
    pub last_newview_time: i64,
    pub new_view_round: u32,
    pub view_change_msg: Option<PbftEnv>,
    pub new_view: Option<PbftEnv>,
    pub msg_buf: Vec<PbftEnv>,
    pub viewchanges: Vec<PbftViewChange>,
    pub prepared_set: Option<PbftPreparedSet>,
}

impl VcInstanceRecord {
    pub fn from_instance(instance: &PbftVcInstance) -> Self {
        VcInstanceRecord {
            view_number: instance.view_number,
            sequence: instance.sequence,
            view_change_round: instance.view_change_round,
            start_time: instance.start_time,
            end_time: instance.end_time,
            last_propose_time: instance.last_propose_time,
            last_newview_time: instance.last_newview_time,
            new_view_round: instance.new_view_round,
            view_change_msg: instance.view_change_msg.clone(),
            new_view: instance.new_view.clone(),
            msg_buf: instance.msg_buf.clone(),
            viewchanges: instance.viewchanges.values().cloned().collect(),
            prepared_set: instance.prepared_set.clone(),
        }
    }

    pub fn into_instance(self) -> PbftVcInstance {
        let mut instance = PbftVcInstance::new(self.view_number, self.start_time);
        instance.sequence = self.sequence;
        instance.view_change_round = self.view_change_round;
        instance.end_time = self.end_time;
        instance.last_propose_time = self.last_propose_time;
        instance.last_newview_time = self.last_newview_time;
        instance.new_view_round = self.new_view_round;
        instance.view_change_msg = self.view_change_msg;
        instance.new_view = self.new_view;
        instance.msg_buf = self.msg_buf;
        instance.viewchanges = self
            .viewchanges
            .into_iter()
            .map(|vc| (vc.replica_id, vc))
            .collect();
        instance.prepared_set = self.prepared_set;
        instance
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Default)]
    struct MemKv {
        map: Mutex<HashMap<String, Vec<u8>>>,
    }

    impl KvStore for MemKv {
        fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
            self.map.lock().insert(key.into(), value.into());
            Ok(())
        }

        fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
            Ok(self.map.lock().get(key).cloned())
        }

        fn delete(&self, key: &str) -> Result<(), StorageError> {
            self.map.lock().remove(key);
            Ok(())
        }

        fn write_batch(&self, ops: Vec<WriteOp>) -> Result<(), StorageError> {
            let mut map = self.map.lock();
            for op in ops {
                match op {
                    WriteOp::Put { key, value } => {
                        map.insert(key, value);
                    }
                    WriteOp::Delete { key } => {
                        map.remove(&key);
                    }
                }
            }
            Ok(())
        }
    }

    #[test]
    fn saver_commits_atomically_and_on_drop() {
        let store: Arc<dyn KvStore> = Arc::new(MemKv::default());
        {
            let mut saver = ValueSaver::new(store.clone());
            saver.save_value("consensus/view_number", &7i64);
            saver.save_value("consensus/view_active", &1u8);
            assert!(store.get("consensus/view_number").unwrap().is_none());
        }
        assert_eq!(
            load_value::<i64>(store.as_ref(), "consensus/view_number").unwrap(),
            Some(7)
        );
        assert_eq!(
            load_value::<u8>(store.as_ref(), "consensus/view_active").unwrap(),
            Some(1)
        );
    }

    #[test]
    fn vc_record_roundtrip() {
        let mut instance = PbftVcInstance::new(3, 1000);
        instance.sequence = 9;
        instance.view_change_round = 2;
        let record = VcInstanceRecord::from_instance(&instance);
        let bytes = codec::to_bytes_canonical(&vec![record]);
        let decoded: Vec<VcInstanceRecord> = codec::from_bytes_canonical(&bytes).unwrap();
        let restored = decoded.into_iter().next().unwrap().into_instance();
        assert_eq!(restored.view_number, 3);
        assert_eq!(restored.sequence, 9);
        assert_eq!(restored.view_change_round, 2);
        assert!(restored.viewchanges.is_empty());
    }
}
