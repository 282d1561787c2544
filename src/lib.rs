mod error;
mod io;
mod types;

pub mod btree;
pub mod store;
pub mod transaction;
pub mod utils;

pub use crate::{
    btree::commit::{ParsedHeader, ENCODING_VERSION},
    error::StoreError,
    store::{Options, Store, USER_INDEX_ID},
    transaction::Transaction,
    types::{ResultOf, SmallResult},
};
