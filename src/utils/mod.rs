pub use id_pool::IdentityPool;

mod id_pool;
