// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! The command-path engine.
//!
//! One worker thread dequeues client commands, rewrites virtual handles to
//! physical ones, loads the contexts the command needs into the device,
//! forwards the command, maps new handles in the response, and saves the
//! loaded state back out so the device's slots are free for the next
//! command. A handful of commands (FlushContext, ContextSave, ContextLoad,
//! GetCapability over transient handles) are answered from the resource
//! manager's own tables without touching the device.

use std::sync::Arc;
use std::thread;

use tracing::{debug, info, warn};

use crate::broker::{success_body, AccessBroker};
use crate::command::Tpm2Command;
use crate::config::ResmgrOptions;
use crate::connection::{Connection, ConnectionId};
use crate::constants::{rc, TpmCap, TpmCc, TpmHt, TpmSt, TpmaCc, TpmaSa};
use crate::handle_map::HandleMapEntry;
use crate::queue::{ControlMessage, Message, MessageQueue, Sink};
use crate::response::Tpm2Response;
use crate::session_list::{SessionEntry, SessionList, SessionState};
use crate::wire::{frame, TpmsContext};

/// Serializing multiplexer between client connections and one TPM device
pub struct ResourceManager {
    broker: Box<dyn AccessBroker>,
    session_list: SessionList,
    in_queue: Arc<MessageQueue>,
    sink: Arc<dyn Sink>,
}

impl ResourceManager {
    pub fn new(
        broker: Box<dyn AccessBroker>,
        options: &ResmgrOptions,
        in_queue: Arc<MessageQueue>,
        sink: Arc<dyn Sink>,
    ) -> Self {
        Self {
            broker,
            session_list: SessionList::new(options.session_max),
            in_queue,
            sink,
        }
    }

    /// The inbound queue; producers enqueue commands and control messages
    /// here.
    pub fn in_queue(&self) -> &Arc<MessageQueue> {
        &self.in_queue
    }

    /// Worker loop: dequeue and process until cancelled or the queue
    /// closes. Unblock from outside by enqueuing
    /// [`ControlMessage::CheckCancel`].
    pub fn run(&mut self) {
        debug!("resource manager worker started");
        while let Some(msg) = self.in_queue.dequeue() {
            match msg {
                Message::Command(command) => self.process_command(command),
                Message::Control(control) => {
                    if !self.process_control(control) {
                        break;
                    }
                }
                Message::Response(_) => {
                    warn!("response message on the inbound queue, dropping");
                }
            }
        }
        debug!("resource manager worker stopped");
    }

    /// Spawn the worker loop on its own thread
    pub fn start(mut self) -> thread::JoinHandle<()> {
        thread::spawn(move || self.run())
    }

    /// Act on a control message. Returns false when the worker should stop.
    fn process_control(&mut self, msg: ControlMessage) -> bool {
        match msg {
            ControlMessage::CheckCancel => {
                self.sink.enqueue(Message::Control(ControlMessage::CheckCancel));
                false
            }
            ControlMessage::ConnectionRemoved(connection) => {
                self.remove_connection(&connection);
                self.sink
                    .enqueue(Message::Control(ControlMessage::ConnectionRemoved(
                        connection,
                    )));
                true
            }
        }
    }

    /// Run one command through the pipeline and emit its response, then
    /// save everything the command left loaded in the device.
    fn process_command(&mut self, command: Tpm2Command) {
        debug!(
            "processing command 0x{:08x}, {} bytes, connection {:?}",
            command.code(),
            command.size(),
            command.connection().id()
        );
        let attrs = command.attributes();
        let connection = Arc::clone(command.connection());
        let mut loaded_transients: Vec<u32> = Vec::new();

        let response = self.dispatch_command(command, &mut loaded_transients);
        debug!(
            "emitting response rc 0x{:08x}, {} bytes",
            response.rc(),
            response.size()
        );
        self.sink.enqueue(Message::Response(response));

        self.save_session_contexts();
        self.post_process_loaded_transients(&connection, &loaded_transients, attrs);
    }

    /// Steps 1-6 of the pipeline: everything up to the response
    fn dispatch_command(
        &mut self,
        mut command: Tpm2Command,
        loaded_transients: &mut Vec<u32>,
    ) -> Tpm2Response {
        let connection = Arc::clone(command.connection());
        let attrs = command.attributes();

        if let Err(code) = self.quota_check(&command) {
            return Tpm2Response::new_rc(&connection, code);
        }
        if let Some(response) = self.special_processing(&command) {
            return response;
        }
        if command.handle_count() > 0 {
            self.load_handles(&mut command, loaded_transients);
        }
        if command.has_auths() {
            self.load_auth_sessions(&command);
        }

        let mut response = match self.broker.send_command(command.buffer()) {
            Ok(bytes) => match Tpm2Response::from_bytes(Arc::clone(&connection), attrs, bytes) {
                Ok(response) => response,
                Err(err) => {
                    warn!("unparsable device response: {err:#}");
                    return Tpm2Response::new_rc(&connection, rc::LAYER_TCTI | rc::GENERAL_FAILURE);
                }
            },
            Err(err) => {
                warn!("device rejected command: {err}");
                return Tpm2Response::new_rc(&connection, err.rc());
            }
        };

        if let Some(replacement) = self.create_context_mapping(&mut response, loaded_transients) {
            return replacement;
        }
        response
    }

    /// Reject commands that would exceed a per-connection quota before any
    /// device interaction happens.
    fn quota_check(&self, command: &Tpm2Command) -> Result<(), u32> {
        match TpmCc::from_u32(command.code()) {
            // these commands consume a transient object slot
            Some(TpmCc::CreatePrimary | TpmCc::Load | TpmCc::LoadExternal) => {
                if command.connection().trans_map().is_full() {
                    info!(
                        "connection {:?} exceeded its transient object quota",
                        command.connection().id()
                    );
                    return Err(rc::RESMGR_OBJECT_MEMORY);
                }
            }
            Some(TpmCc::StartAuthSession) => {
                if self.session_list.is_full(command.connection().id()) {
                    info!(
                        "connection {:?} exceeded its session quota",
                        command.connection().id()
                    );
                    return Err(rc::RESMGR_SESSION_MEMORY);
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Commands the resource manager answers (partly) by itself. A returned
    /// response short-circuits the pipeline; `None` forwards the command to
    /// the device unchanged.
    fn special_processing(&mut self, command: &Tpm2Command) -> Option<Tpm2Response> {
        match TpmCc::from_u32(command.code()) {
            Some(TpmCc::FlushContext) => self.flush_context(command),
            Some(TpmCc::ContextSave) => self.save_context(command),
            Some(TpmCc::ContextLoad) => self.load_context(command),
            Some(TpmCc::GetCapability) => self.cap_handles(command),
            _ => None,
        }
    }

    /// FlushContext: flushing a tracked transient object is pure
    /// bookkeeping, the object is never resident between commands. Session
    /// flushes drop our tracking and still go to the device, which holds
    /// state for saved sessions.
    fn flush_context(&mut self, command: &Tpm2Command) -> Option<Tpm2Response> {
        let connection = command.connection();
        let handle = match command.flush_handle() {
            Ok(handle) => handle,
            Err(err) => {
                warn!("malformed FlushContext: {err:#}");
                return Some(Tpm2Response::new_rc(
                    connection,
                    rc::resmgr(rc::INSUFFICIENT),
                ));
            }
        };
        match TpmHt::of(handle) {
            Some(TpmHt::Transient) => {
                let code = if connection.trans_map().remove(handle).is_some() {
                    debug!("virtual handle 0x{handle:08x} flushed");
                    rc::SUCCESS
                } else {
                    rc::resmgr(rc::HANDLE | rc::P | rc::RC_1)
                };
                Some(Tpm2Response::new_rc(connection, code))
            }
            Some(kind) if kind.is_session() => {
                if self.session_list.remove_handle(handle).is_some() {
                    debug!("dropped tracking for session 0x{handle:08x}");
                }
                None
            }
            _ => None,
        }
    }

    /// ContextSave on a session: hand the client the context bytes we
    /// already hold and mark the session saved-by-client. Anything else is
    /// the device's business.
    fn save_context(&mut self, command: &Tpm2Command) -> Option<Tpm2Response> {
        let handle = command.handle(0).ok()?;
        if !TpmHt::of(handle).is_some_and(TpmHt::is_session) {
            debug!("not virtualizing ContextSave for handle 0x{handle:08x}");
            return None;
        }
        let connection = command.connection();
        let Some(entry) = self.session_list.lookup_handle_mut(handle) else {
            warn!("client saving unknown session 0x{handle:08x}");
            return None;
        };
        if entry.connection() != connection.id() {
            warn!("session 0x{handle:08x} belongs to another connection, refusing to save");
            return None;
        }
        entry.set_state(SessionState::SavedClient);
        let context = entry.context().to_vec();
        Some(Tpm2Response::new_context_save(connection, &context))
    }

    /// ContextLoad of a session context we recognize: return the session's
    /// stable handle without involving the device. An unknown context is
    /// forwarded; the device either accepts it (and the response mapping
    /// starts tracking the session) or rejects it.
    fn load_context(&mut self, command: &Tpm2Command) -> Option<Tpm2Response> {
        let context = match TpmsContext::parse(command.body()) {
            Ok(context) => context,
            Err(err) => {
                warn!("unparsable TPMS_CONTEXT in ContextLoad: {err:#}");
                return None;
            }
        };
        if !TpmHt::of(context.saved_handle).is_some_and(TpmHt::is_session) {
            debug!(
                "not virtualizing ContextLoad for handle 0x{:08x}",
                context.saved_handle
            );
            return None;
        }
        let connection = command.connection();
        let Some((handle, owner)) = self.session_list.lookup_context(command.body()) else {
            debug!("ContextLoad with unknown session context, forwarding");
            return None;
        };
        if owner != connection.id() && !self.session_list.claim(handle, connection.id()) {
            debug!(
                "connection {:?} may not load session 0x{handle:08x} owned by {owner:?}",
                connection.id()
            );
            return None;
        }
        if let Some(entry) = self.session_list.lookup_handle_mut(handle) {
            entry.set_state(SessionState::SavedRm);
        }
        Some(Tpm2Response::new_context_load(connection, handle))
    }

    /// GetCapability over the transient handle range: the device only knows
    /// physical handles, so enumerate the connection's virtual ones.
    fn cap_handles(&self, command: &Tpm2Command) -> Option<Tpm2Response> {
        let (cap, prop, count) = match command.capability_args() {
            Ok(args) => args,
            Err(err) => {
                warn!("malformed GetCapability: {err:#}");
                return None;
            }
        };
        if cap != TpmCap::Handles.to_u32() || TpmHt::of(prop) != Some(TpmHt::Transient) {
            return None;
        }
        let connection = command.connection();
        let mut handles = Vec::new();
        let mut more_data = false;
        for vhandle in connection.trans_map().keys_sorted() {
            if vhandle < prop {
                continue;
            }
            if handles.len() as u32 >= count {
                more_data = true;
                break;
            }
            handles.push(vhandle);
        }
        Some(Tpm2Response::new_cap_handles(connection, more_data, &handles))
    }

    /// Step 3: load the object behind every virtual handle in the handle
    /// area and rewrite the handle in place. Load failures do not abort;
    /// the device produces the canonical error for the remaining handle.
    fn load_handles(&mut self, command: &mut Tpm2Command, loaded_transients: &mut Vec<u32>) {
        let handles = match command.handles() {
            Ok(handles) => handles,
            Err(err) => {
                warn!("failed to read command handle area: {err:#}");
                return;
            }
        };
        for (index, handle) in handles.into_iter().enumerate() {
            match TpmHt::of(handle) {
                Some(TpmHt::Transient) => {
                    self.load_transient(command, loaded_transients, handle, index);
                }
                Some(kind) if kind.is_session() => {
                    let connection = command.connection().id();
                    self.load_session_from_handle(connection, handle, false);
                }
                _ => {}
            }
        }
    }

    /// Load one transient object's saved context and swap the virtual
    /// handle in the command for the physical one the device assigned.
    fn load_transient(
        &mut self,
        command: &mut Tpm2Command,
        loaded_transients: &mut Vec<u32>,
        vhandle: u32,
        index: usize,
    ) {
        let connection = Arc::clone(command.connection());
        let context = match connection.trans_map().lookup(vhandle) {
            Some(entry) => entry.context().to_vec(),
            None => {
                warn!("no mapping for virtual handle 0x{vhandle:08x}");
                return;
            }
        };
        match self.broker.context_load(&context) {
            Ok(phandle) => {
                debug!("virtual handle 0x{vhandle:08x} loaded at 0x{phandle:08x}");
                if let Some(entry) = connection.trans_map().lookup_mut(vhandle) {
                    entry.set_phandle(phandle);
                }
                if let Err(err) = command.set_handle(index, phandle) {
                    warn!("failed to rewrite handle {index}: {err:#}");
                    return;
                }
                loaded_transients.push(vhandle);
            }
            Err(err) => {
                warn!("failed to load context for virtual handle 0x{vhandle:08x}: {err}");
            }
        }
    }

    /// Step 4: sessions referenced from the auth area. A session whose
    /// CONTINUESESSION bit is clear is consumed by this command and
    /// forgotten once loaded.
    fn load_auth_sessions(&mut self, command: &Tpm2Command) {
        let auths = match command.auths() {
            Ok(auths) => auths,
            Err(err) => {
                warn!("failed to parse auth area: {err:#}");
                return;
            }
        };
        for auth in auths {
            match TpmHt::of(auth.handle) {
                Some(kind) if kind.is_session() => {
                    let will_flush = auth.attributes & TpmaSa::CONTINUE_SESSION == 0;
                    self.load_session_from_handle(command.connection().id(), auth.handle, will_flush);
                }
                _ => {
                    debug!(
                        "auth handle 0x{:08x} is not a session, skipping",
                        auth.handle
                    );
                }
            }
        }
    }

    /// Load a tracked session into the device. Refuses sessions we do not
    /// track, sessions owned by another connection and sessions not saved
    /// by the resource manager; in each case the device fails the command
    /// with its own error.
    fn load_session_from_handle(&mut self, connection: ConnectionId, handle: u32, will_flush: bool) {
        let Some(entry) = self.session_list.lookup_handle(handle) else {
            debug!("no session 0x{handle:08x} known to the resource manager");
            return;
        };
        if entry.connection() != connection {
            warn!("session 0x{handle:08x} belongs to another connection, refusing to load");
            return;
        }
        if entry.state() != SessionState::SavedRm {
            warn!(
                "session 0x{handle:08x} in state {:?}, not loadable",
                entry.state()
            );
            return;
        }
        let context = entry.context().to_vec();
        match self.broker.context_load(&context) {
            Ok(_) => {
                if will_flush {
                    // the command consumes the session's last use
                    self.session_list.remove_handle(handle);
                } else if let Some(entry) = self.session_list.lookup_handle_mut(handle) {
                    entry.set_state(SessionState::Loaded);
                }
            }
            Err(err) => {
                warn!("failed to load session context 0x{handle:08x}: {err}");
                self.session_list.remove_handle(handle);
            }
        }
    }

    /// Step 6: a handle in the response is a new object or session the
    /// client must see virtualized. Returns a replacement response when the
    /// virtual handle space is exhausted.
    fn create_context_mapping(
        &mut self,
        response: &mut Tpm2Response,
        loaded_transients: &mut Vec<u32>,
    ) -> Option<Tpm2Response> {
        let handle = response.handle()?;
        match TpmHt::of(handle) {
            Some(TpmHt::Transient) => self.map_transient_response(response, loaded_transients),
            Some(kind) if kind.is_session() => {
                self.map_session_response(response, handle);
                None
            }
            _ => {
                debug!("not mapping response handle 0x{handle:08x}");
                None
            }
        }
    }

    /// Pair the fresh physical handle with a new virtual one and hand the
    /// virtual handle to the client.
    fn map_transient_response(
        &mut self,
        response: &mut Tpm2Response,
        loaded_transients: &mut Vec<u32>,
    ) -> Option<Tpm2Response> {
        let phandle = response.handle()?;
        let connection = Arc::clone(response.connection());
        let allocated = connection.trans_map().next_vhandle();
        let Some(vhandle) = allocated else {
            warn!(
                "virtual handle space exhausted for connection {:?}",
                connection.id()
            );
            if let Err(err) = self.broker.context_flush(phandle) {
                warn!("failed to flush unmappable handle 0x{phandle:08x}: {err}");
            }
            return Some(Tpm2Response::new_rc(&connection, rc::RESMGR_OBJECT_MEMORY));
        };
        debug!("mapping physical handle 0x{phandle:08x} to virtual 0x{vhandle:08x}");
        connection
            .trans_map()
            .insert(vhandle, HandleMapEntry::new(phandle, vhandle));
        response.set_handle(vhandle);
        loaded_transients.push(vhandle);
        None
    }

    /// A session handle in a response is either a session just created by
    /// StartAuthSession or one reloaded by a forwarded ContextLoad.
    fn map_session_response(&mut self, response: &Tpm2Response, handle: u32) {
        let connection = response.connection();
        match self.session_list.lookup_handle(handle) {
            Some(entry) => {
                if entry.connection() != connection.id() {
                    warn!(
                        "session 0x{handle:08x} in response is owned by {:?}, not {:?}",
                        entry.connection(),
                        connection.id()
                    );
                }
            }
            None => {
                debug!("tracking new session 0x{handle:08x}");
                self.session_list
                    .insert(SessionEntry::new(connection.id(), handle));
            }
        }
    }

    /// Step 8: every session the command left loaded gets its context saved
    /// back out of the device. A session that cannot be saved is flushed
    /// and forgotten.
    fn save_session_contexts(&mut self) {
        for handle in self.session_list.loaded_handles() {
            let cmd = frame(
                TpmSt::NoSessions,
                TpmCc::ContextSave.to_u32(),
                &handle.to_be_bytes(),
            );
            let saved = self
                .broker
                .send_command(&cmd)
                .and_then(|response| success_body(&response));
            match saved {
                Ok(context) => {
                    if let Some(entry) = self.session_list.lookup_handle_mut(handle) {
                        entry.set_context(context);
                        entry.set_state(SessionState::SavedRm);
                    }
                }
                Err(err) => {
                    warn!("failed to save session 0x{handle:08x}: {err}");
                    if let Err(err) = self.broker.context_flush(handle) {
                        warn!("failed to flush session 0x{handle:08x}: {err}");
                    }
                    self.session_list.remove_handle(handle);
                }
            }
        }
    }

    /// Step 9: transient objects loaded for this command either were
    /// flushed by the command itself or must be saved and flushed now.
    fn post_process_loaded_transients(
        &mut self,
        connection: &Arc<Connection>,
        loaded_transients: &[u32],
        attrs: TpmaCc,
    ) {
        if loaded_transients.is_empty() {
            return;
        }
        if attrs.is_flushed() {
            debug!(
                "command flushed its objects, dropping {} mappings",
                loaded_transients.len()
            );
            let mut map = connection.trans_map();
            for &vhandle in loaded_transients {
                map.remove(vhandle);
            }
            return;
        }
        for &vhandle in loaded_transients {
            self.flushsave_context(connection, vhandle);
        }
    }

    /// Save one resident transient object's context and free its device
    /// slot. The physical handle is cleared even when the save fails, so an
    /// entry never points at a slot the device may reuse.
    fn flushsave_context(&mut self, connection: &Arc<Connection>, vhandle: u32) {
        let phandle = match connection.trans_map().lookup(vhandle) {
            Some(entry) => entry.phandle(),
            None => return,
        };
        if TpmHt::of(phandle) != Some(TpmHt::Transient) {
            return;
        }
        match self.broker.context_saveflush(phandle) {
            Ok(context) => {
                if let Some(entry) = connection.trans_map().lookup_mut(vhandle) {
                    entry.set_context(context);
                    entry.set_phandle(0);
                }
            }
            Err(err) => {
                warn!("context save failed for physical handle 0x{phandle:08x}: {err}");
                if let Some(entry) = connection.trans_map().lookup_mut(vhandle) {
                    entry.set_phandle(0);
                }
            }
        }
    }

    /// Connection teardown: sessions saved by the client are kept around
    /// briefly for another connection to claim; sessions saved by the
    /// resource manager die with their connection. Transient mappings live
    /// inside the connection and are discarded with it.
    fn remove_connection(&mut self, connection: &Connection) {
        info!(
            "flushing session contexts for connection {:?}",
            connection.id()
        );
        for (handle, state) in self.session_list.handles_for_connection(connection.id()) {
            match state {
                SessionState::SavedClient => {
                    self.session_list.abandon_handle(connection.id(), handle);
                    let Self {
                        broker,
                        session_list,
                        ..
                    } = self;
                    session_list.prune_abandoned(|stale| match broker.context_flush(stale) {
                        Ok(()) => true,
                        Err(err) => {
                            warn!("failed to flush abandoned session 0x{stale:08x}: {err}");
                            false
                        }
                    });
                }
                SessionState::SavedRm => {
                    if let Err(err) = self.broker.context_flush(handle) {
                        warn!("failed to flush session 0x{handle:08x}: {err}");
                    }
                    self.session_list.remove_handle(handle);
                }
                state => panic!(
                    "connection closed with session 0x{handle:08x} in unexpected state {state:?}"
                ),
            }
        }
    }

    #[cfg(test)]
    fn session_list(&self) -> &SessionList {
        &self.session_list
    }
}
