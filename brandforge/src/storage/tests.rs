use super::*;
use rand::prelude::*;

pub struct TestHarness {
    pub db: Db,
    pub storage_path: String,
}

impl TestHarness {
    pub async fn new() -> Self {
        let mut rng = rand::thread_rng();
        let append_num: u32 = rng.gen();
        let storage_path = format!("/tmp/brandforge_tests_storage{}.db", append_num);

        let db = Db::new(&storage_path).await.unwrap();

        Self { db, storage_path }
    }

    pub async fn read_conn(&self) -> Result<PoolConnection<Sqlite>, StorageError> {
        self.db.read_conn().await
    }

    pub async fn write_conn(&self) -> Result<PoolConnection<Sqlite>, StorageError> {
        self.db.write_conn().await
    }
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.storage_path);
        let _ = std::fs::remove_file(format!("{}{}", &self.storage_path, "-shm"));
        let _ = std::fs::remove_file(format!("{}{}", &self.storage_path, "-wal"));
    }
}
