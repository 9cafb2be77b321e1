//! redb table definitions, one per lifetime scope.
//!
//! Every table uses `&str` keys (see [`RecordKey::table_key`]) and `&[u8]`
//! values holding a JSON-serialized [`StoredRecord`].
//!
//! [`RecordKey::table_key`]: crate::types::RecordKey::table_key
//! [`StoredRecord`]: crate::types::StoredRecord

use redb::TableDefinition;
use tally_core::Lifetime;

pub const PING_LIFETIME: TableDefinition<&str, &[u8]> = TableDefinition::new("ping_lifetime");

pub const APPLICATION_LIFETIME: TableDefinition<&str, &[u8]> =
    TableDefinition::new("application_lifetime");

pub const USER_LIFETIME: TableDefinition<&str, &[u8]> = TableDefinition::new("user_lifetime");

pub fn table_for(lifetime: Lifetime) -> TableDefinition<'static, &'static str, &'static [u8]> {
    match lifetime {
        Lifetime::Ping => PING_LIFETIME,
        Lifetime::Application => APPLICATION_LIFETIME,
        Lifetime::User => USER_LIFETIME,
    }
}
