pub mod wal;
pub mod wal_record;
pub mod wal_replayer;
