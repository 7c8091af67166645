// src/rdconfig.rs
use redis::Client;

pub fn open_client(redis_url: &str) -> redis::RedisResult<Client> {
    // Client::open will auto-handle rediss:// if TLS feature is enabled
    Client::open(redis_url)
}
