//! Per-connection protocol state machine.
//!
//! A session starts anonymous and becomes authenticated with its first
//! packet, which must be a `Login`. Every other packet is only valid once
//! authenticated. Anything unexpected is fatal to the connection.

use std::iter;

use bytes::Bytes;
use futures::channel::mpsc;
use futures::future::try_join_all;
use futures::{stream, Stream, TryStreamExt};
use tracing::{debug, info, warn};

use fchat_net::{Connection, ConnectionError};
use fchat_shared::constants::FILE_CHUNK_SIZE;
use fchat_shared::protocol::{
    ChannelUpdated, RequestFile, RequestMessages, SendFile, SendMessage, UpdateChannel,
};
use fchat_shared::{Message, Name, Packet};
use fchat_store::{validate_file_name, FileDownload, Storage};

use crate::error::SessionError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Anonymous,
    Authenticated(Name),
}

pub struct Session {
    connection: Connection,
    storage: Storage,
    state: State,
}

impl Session {
    pub fn new(connection: Connection, storage: Storage) -> Self {
        Self {
            connection,
            storage,
            state: State::Anonymous,
        }
    }

    /// Serve packets until the peer disconnects or something goes wrong.
    /// A disconnect between two packets is a normal end.
    pub async fn run(mut self) -> Result<(), SessionError> {
        loop {
            let packet = match self.connection.read_packet().await {
                Ok(Some(packet)) => packet,
                Ok(None) => return Err(SessionError::violation("null frame instead of a packet")),
                Err(e) if e.is_disconnect() => {
                    debug!("Peer disconnected");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };

            debug!(kind = packet.kind(), "Packet received");
            self.handle(packet).await?;
        }
    }

    async fn handle(&mut self, packet: Packet) -> Result<(), SessionError> {
        let State::Authenticated(user) = &self.state else {
            return self.login(packet);
        };
        let user = user.clone();

        match packet {
            Packet::Login(_) => Err(SessionError::violation("second Login")),
            Packet::RequestUpdates => self.send_updates(&user).await,
            Packet::UpdateChannel(update) => self.update_channel(&user, update).await,
            Packet::SendMessage(SendMessage { channel, message }) => {
                self.storage.append_message(channel, &message).await?;
                Ok(())
            }
            Packet::RequestMessages(request) => self.send_messages(request).await,
            Packet::SendFile(upload) => self.receive_file(&user, upload).await,
            Packet::RequestFile(request) => self.send_file(request).await,
            Packet::ChannelUpdated(_) => {
                Err(SessionError::violation("ChannelUpdated is server-to-client only"))
            }
            Packet::Acknowledge(_) => {
                Err(SessionError::violation("Acknowledge outside a file download"))
            }
        }
    }

    fn login(&mut self, packet: Packet) -> Result<(), SessionError> {
        match packet {
            Packet::Login(login) => {
                info!(username = %login.username, "Logged in");
                self.state = State::Authenticated(login.username);
                Ok(())
            }
            other => Err(SessionError::violation(format!("{} before Login", other.kind()))),
        }
    }

    /// Stream every pending update, dropping each one once it has been
    /// written to the socket, then end the sequence with a null frame.
    async fn send_updates(&self, user: &Name) -> Result<(), SessionError> {
        let mut updates = self.storage.list_updates(user);
        let mut sent = 0usize;

        while let Some(update) = updates.try_next().await? {
            self.connection
                .send_packet(Some(&Packet::ChannelUpdated(update.clone())))
                .await?;
            sent += 1;

            // Redelivery on the next request is harmless, so a failed delete
            // does not end the session.
            if let Err(e) = self.storage.delete_update(user, &update).await {
                warn!(channel = %update.channel, error = %e, "Failed to delete delivered update");
            }
        }

        self.connection.send_packet(None).await?;
        debug!(count = sent, "Delivered channel updates");
        Ok(())
    }

    /// Store one notification per member and one for the sender. Completes
    /// only once every notification is on disk.
    async fn update_channel(&self, user: &Name, update: UpdateChannel) -> Result<(), SessionError> {
        let UpdateChannel {
            channel,
            name,
            members,
        } = update;

        let name_for = |recipient_is_sender: bool| match (&name, members.as_slice()) {
            (Some(name), _) => name.clone(),
            (None, [counterpart]) if recipient_is_sender => counterpart.clone(),
            (None, [_]) => user.clone(),
            (None, _) => Name::group_channel(),
        };

        let notifications: Vec<(Name, ChannelUpdated)> = members
            .iter()
            .map(|member| (member.clone(), name_for(false)))
            .chain(iter::once((user.clone(), name_for(true))))
            .map(|(recipient, label)| (recipient, ChannelUpdated { channel, name: label }))
            .collect();

        try_join_all(
            notifications
                .iter()
                .map(|(recipient, update)| self.storage.save_update(recipient, update.clone())),
        )
        .await?;

        info!(channel = %channel, recipients = notifications.len(), "Channel updated");
        Ok(())
    }

    async fn send_messages(&self, request: RequestMessages) -> Result<(), SessionError> {
        let RequestMessages { channel, count } = request;
        let mut messages = self.storage.recent_messages(channel, count);

        while let Some(message) = messages.try_next().await? {
            self.connection
                .send_packet(Some(&Packet::SendMessage(SendMessage { channel, message })))
                .await?;
        }

        self.connection.send_packet(None).await?;
        Ok(())
    }

    /// Receive an upload: before each chunk the client gets a null frame as
    /// its cue to send the next one, and an empty chunk ends the transfer.
    async fn receive_file(&self, user: &Name, upload: SendFile) -> Result<(), SessionError> {
        let SendFile {
            channel,
            name,
            size: announced,
        } = upload;
        validate_file_name(&name).map_err(|e| SessionError::violation(e.to_string()))?;

        let chunks = cued_chunks(self.connection.clone());
        let saved = self.storage.save_file(channel, &name, chunks).await?;

        if saved.size != announced {
            debug!(announced, received = saved.size, "Upload size differs from announcement");
        }

        let summary = format!("file \"{}\" ({} bytes)", saved.name, saved.size);
        let summary = Message::new(user.clone(), summary)
            .map_err(|e| SessionError::violation(e.to_string()))?;
        self.storage.append_message(channel, &summary).await?;
        Ok(())
    }

    /// Serve a download: a `SendFile` header, then one chunk per
    /// `Acknowledge`, then an empty frame. A missing file is answered with a
    /// null frame instead of the header.
    async fn send_file(&self, request: RequestFile) -> Result<(), SessionError> {
        let RequestFile { channel, name } = request;
        validate_file_name(&name).map_err(|e| SessionError::violation(e.to_string()))?;
        let (requests, pulls) = mpsc::unbounded::<usize>();

        let Some(FileDownload { size, mut chunks }) =
            self.storage.get_file(channel, &name, pulls).await?
        else {
            debug!(channel = %channel, name = %name, "Requested file does not exist");
            self.connection.send_packet(None).await?;
            return Ok(());
        };

        let header = Packet::SendFile(SendFile {
            channel,
            name: name.clone(),
            size,
        });
        self.connection.send_packet(Some(&header)).await?;

        // The download only ends early if the session is gone, so a failed
        // pull request has nobody left to report to.
        let _ = requests.unbounded_send(FILE_CHUNK_SIZE);
        while let Some(chunk) = chunks.try_next().await? {
            self.connection.send_bytes(chunk).await?;

            match self.connection.read_packet().await? {
                Some(Packet::Acknowledge(_)) => {}
                Some(other) => {
                    return Err(SessionError::violation(format!(
                        "{} during a file download",
                        other.kind()
                    )));
                }
                None => return Err(SessionError::violation("null frame instead of Acknowledge")),
            }
            let _ = requests.unbounded_send(FILE_CHUNK_SIZE);
        }

        self.connection.send_bytes(Bytes::new()).await?;
        info!(channel = %channel, name = %name, size, "File sent");
        Ok(())
    }
}

/// Upload chunks pulled from the client: every poll first sends the null
/// "ready" cue, then reads one raw frame. Ends after the empty frame.
fn cued_chunks(connection: Connection) -> impl Stream<Item = Result<Bytes, ConnectionError>> {
    stream::unfold(Some(connection), |connection| async move {
        let connection = connection?;
        if let Err(e) = connection.send_packet(None).await {
            return Some((Err(e), None));
        }
        match connection.read_bytes().await {
            Ok(chunk) if chunk.is_empty() => Some((Ok(chunk), None)),
            Ok(chunk) => Some((Ok(chunk), Some(connection))),
            Err(e) => Some((Err(e), None)),
        }
    })
}
