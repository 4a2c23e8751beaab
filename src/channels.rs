//! In-memory coordination channels.

use crate::core::agent::AgentId;
use crate::error::{Error, Result};
use crate::ports::{ChannelInfo, CoordinationChannel, Participant};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

/// A message posted to a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMessage {
    pub sender: String,
    pub body: String,
    pub timestamp: DateTime<Utc>,
}

struct Room {
    info: ChannelInfo,
    participants: Vec<Participant>,
    messages: Vec<ChannelMessage>,
}

/// Process-local [`CoordinationChannel`] implementation.
#[derive(Default)]
pub struct ChannelHub {
    rooms: RwLock<HashMap<String, Room>>,
}

impl ChannelHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or reactivate a participant.
    pub async fn join(&self, channel: &str, name: &str, agent_id: Option<AgentId>) -> Result<()> {
        let mut rooms = self.rooms.write().await;
        let room = open_room(&mut rooms, channel)?;
        let now = Utc::now();
        match room.participants.iter_mut().find(|p| p.name == name) {
            Some(p) => {
                p.active = true;
                p.last_seen = now;
            }
            None => room.participants.push(Participant {
                name: name.to_string(),
                agent_id,
                active: true,
                last_seen: now,
            }),
        }
        room.info.last_activity = now;
        Ok(())
    }

    /// Mark a participant inactive.
    pub async fn leave(&self, channel: &str, name: &str) -> Result<()> {
        let mut rooms = self.rooms.write().await;
        let room = open_room(&mut rooms, channel)?;
        if let Some(p) = room.participants.iter_mut().find(|p| p.name == name) {
            p.active = false;
        }
        Ok(())
    }

    pub async fn messages(&self, channel: &str) -> Result<Vec<ChannelMessage>> {
        let rooms = self.rooms.read().await;
        rooms
            .get(channel)
            .map(|room| room.messages.clone())
            .ok_or_else(|| Error::ChannelNotFound(channel.to_string()))
    }

    /// Info for a channel, open or closed.
    pub async fn info(&self, channel: &str) -> Option<ChannelInfo> {
        self.rooms.read().await.get(channel).map(|r| r.info.clone())
    }

    /// Overwrite the last activity time.
    pub async fn set_last_activity(&self, channel: &str, at: DateTime<Utc>) -> Result<()> {
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .get_mut(channel)
            .ok_or_else(|| Error::ChannelNotFound(channel.to_string()))?;
        room.info.last_activity = at;
        Ok(())
    }
}

fn open_room<'a>(rooms: &'a mut HashMap<String, Room>, channel: &str) -> Result<&'a mut Room> {
    match rooms.get_mut(channel) {
        Some(room) if !room.info.closed => Ok(room),
        Some(_) => Err(Error::Channel(format!("channel {} is closed", channel))),
        None => Err(Error::ChannelNotFound(channel.to_string())),
    }
}

#[async_trait]
impl CoordinationChannel for ChannelHub {
    async fn create_channel(&self, name: &str, scope: &str) -> Result<ChannelInfo> {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(name) {
            if !room.info.closed {
                return Ok(room.info.clone());
            }
        }
        let now = Utc::now();
        let info = ChannelInfo {
            name: name.to_string(),
            scope: scope.to_string(),
            created_at: now,
            last_activity: now,
            closed: false,
        };
        rooms.insert(
            name.to_string(),
            Room {
                info: info.clone(),
                participants: Vec::new(),
                messages: Vec::new(),
            },
        );
        debug!(channel = name, scope, "channel created");
        Ok(info)
    }

    async fn send_message(&self, channel: &str, sender: &str, body: &str) -> Result<()> {
        let mut rooms = self.rooms.write().await;
        let room = open_room(&mut rooms, channel)?;
        let now = Utc::now();
        room.messages.push(ChannelMessage {
            sender: sender.to_string(),
            body: body.to_string(),
            timestamp: now,
        });
        room.info.last_activity = now;
        Ok(())
    }

    async fn list_participants(&self, channel: &str) -> Result<Vec<Participant>> {
        let rooms = self.rooms.read().await;
        rooms
            .get(channel)
            .map(|room| room.participants.clone())
            .ok_or_else(|| Error::ChannelNotFound(channel.to_string()))
    }

    async fn list_channels(&self, scope: Option<&str>) -> Result<Vec<ChannelInfo>> {
        let rooms = self.rooms.read().await;
        let mut channels: Vec<ChannelInfo> = rooms
            .values()
            .filter(|r| !r.info.closed && scope.is_none_or(|s| s == r.info.scope))
            .map(|r| r.info.clone())
            .collect();
        channels.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        Ok(channels)
    }

    async fn close(&self, channel: &str) -> Result<()> {
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .get_mut(channel)
            .ok_or_else(|| Error::ChannelNotFound(channel.to_string()))?;
        room.info.closed = true;
        for p in &mut room.participants {
            p.active = false;
        }
        debug!(channel, "channel closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let hub = ChannelHub::new();
        let first = hub.create_channel("run-1", "/repo").await.unwrap();
        let second = hub.create_channel("run-1", "/repo").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(hub.list_channels(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_messages_and_participants() {
        let hub = ChannelHub::new();
        hub.create_channel("run-1", "/repo").await.unwrap();
        hub.join("run-1", "backend", Some(AgentId::new())).await.unwrap();
        hub.send_message("run-1", "backend", "started").await.unwrap();

        let participants = hub.list_participants("run-1").await.unwrap();
        assert_eq!(participants.len(), 1);
        assert!(participants[0].active);
        assert_eq!(hub.messages("run-1").await.unwrap()[0].body, "started");

        hub.leave("run-1", "backend").await.unwrap();
        assert!(!hub.list_participants("run-1").await.unwrap()[0].active);
    }

    #[tokio::test]
    async fn test_closed_channel_rejects_messages() {
        let hub = ChannelHub::new();
        hub.create_channel("run-1", "/repo").await.unwrap();
        hub.close("run-1").await.unwrap();

        assert!(matches!(
            hub.send_message("run-1", "x", "y").await,
            Err(Error::Channel(_))
        ));
        assert!(hub.list_channels(Some("/repo")).await.unwrap().is_empty());
        assert!(hub.info("run-1").await.unwrap().closed);
    }

    #[tokio::test]
    async fn test_unknown_channel() {
        let hub = ChannelHub::new();
        assert!(matches!(
            hub.close("nope").await,
            Err(Error::ChannelNotFound(_))
        ));
        assert!(matches!(
            hub.list_participants("nope").await,
            Err(Error::ChannelNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_channels_by_scope() {
        let hub = ChannelHub::new();
        hub.create_channel("a", "/repo").await.unwrap();
        hub.create_channel("b", "/other").await.unwrap();
        let channels = hub.list_channels(Some("/repo")).await.unwrap();
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].name, "a");
    }
}
