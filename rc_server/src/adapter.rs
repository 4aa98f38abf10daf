use uuid::Uuid;

/// Bridge to the game server software hosting the kernel.
#[async_trait::async_trait]
pub trait ServerAdapter: Send + Sync {
    /// Number of players currently online, reported in every ping.
    async fn online_player_count(&self) -> i64;

    /// Applies the player cap granted by the proxy.
    async fn set_max_players(&self, max_players: i32);

    async fn player_uuid(&self, username: &str) -> Option<Uuid>;

    async fn player_username(&self, uuid: Uuid) -> Option<String>;

    async fn is_online(&self, uuid: Uuid) -> bool;

    /// Sends a chat message to a player.
    ///
    /// ## Arguments
    ///
    /// * `uuid` - Player UUID
    /// * `message` - Message to show
    async fn send_message(&self, uuid: Uuid, message: &str);
}
