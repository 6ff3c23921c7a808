//! The rule engine's exposed-token table
//!
//! The rule engine publishes the tokens it wants visible on the bus into
//! a key-sorted table; the node broadcasts the broadcast-flagged subset
//! on its status schedule, compressed. Status tokens received from the
//! bus update matching entries so equations see the network's state.
//!
//! The bytecode interpreter itself lives outside this crate; this table
//! is the contract the protocol core consumes.

use ecconet_common::{Token, TokenFlags, TokenKey};
use heapless::Vec;

/// Capacity of the exposed-token table
pub const TOKEN_TABLE_SIZE: usize = 50;

#[derive(Debug)]
pub(crate) struct TokenTable {
    tokens: Vec<Token, TOKEN_TABLE_SIZE>,
}

impl TokenTable {
    pub fn new() -> Self {
        TokenTable { tokens: Vec::new() }
    }

    pub fn reset(&mut self) {
        self.tokens.clear();
    }

    /// Update the entry matching a received status token's key.
    ///
    /// Tokens with no matching entry are ignored; the table's shape is
    /// owned by the local rule set, not by the bus.
    pub fn observe(&mut self, token: &Token) {
        let body = token.key.body();
        if let Some(entry) = self.tokens.iter_mut().find(|t| t.key.body() == body) {
            entry.value = token.value;
        }
    }

    /// Publish a local token, inserting or updating its entry and
    /// flagging it for broadcast.
    ///
    /// The key is stored as given, class prefix included, and entries
    /// stay key-sorted so the codec can fold runs of consecutive keys.
    /// A full table drops the new entry.
    pub fn publish(&mut self, key: TokenKey, value: i32) {
        if let Some(entry) = self.tokens.iter_mut().find(|t| t.key == key) {
            entry.value = value;
            entry.flags |= TokenFlags::SHOULD_BROADCAST;
            return;
        }
        let position = self
            .tokens
            .iter()
            .position(|t| t.key > key)
            .unwrap_or(self.tokens.len());
        let mut token = Token::new(0, key, value);
        token.flags = TokenFlags::SHOULD_BROADCAST;
        self.tokens.insert(position, token).ok();
    }

    /// Whether anything is flagged for broadcast
    pub fn has_broadcast_tokens(&self) -> bool {
        self.tokens
            .iter()
            .any(|t| t.flags.contains(TokenFlags::SHOULD_BROADCAST))
    }

    /// The key-sorted table contents
    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecconet_common::KeyPrefix;

    #[test]
    fn publish_keeps_keys_sorted() {
        let mut table = TokenTable::new();
        table.publish(TokenKey::new(1002), 30);
        table.publish(TokenKey::new(1000), 10);
        table.publish(TokenKey::new(1001), 20);

        let keys: std::vec::Vec<u16> = table.tokens().iter().map(|t| t.key.raw()).collect();
        assert_eq!(vec![1000, 1001, 1002], keys);
        assert!(table.has_broadcast_tokens());
    }

    #[test]
    fn observe_updates_only_known_keys() {
        let mut table = TokenTable::new();
        table.publish(TokenKey::new(1000), 10);

        let incoming = Token::new(
            9,
            TokenKey::new(1000).with_prefix(KeyPrefix::OutputStatus),
            77,
        );
        table.observe(&incoming);
        assert_eq!(77, table.tokens()[0].value);

        let unknown = Token::new(9, TokenKey::new(1234), 5);
        table.observe(&unknown);
        assert_eq!(1, table.tokens().len());
    }

    #[test]
    fn republish_updates_in_place() {
        let mut table = TokenTable::new();
        table.publish(TokenKey::new(1000), 10);
        table.publish(TokenKey::new(1000), 99);
        assert_eq!(1, table.tokens().len());
        assert_eq!(99, table.tokens()[0].value);
    }
}
