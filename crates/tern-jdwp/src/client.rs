use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::{broadcast, oneshot, Mutex},
};
use tokio_util::sync::CancellationToken;

use super::{
    codec::{encode_command, signature_to_tag, JdwpReader, JdwpWriter, FLAG_REPLY, HANDSHAKE, HEADER_LEN},
    types::{
        ClassInfo, FieldInfo, FrameId, FrameInfo, JdwpError, JdwpEvent, JdwpIdSizes, JdwpValue,
        LineTable, LineTableEntry, Location, MethodId, MethodInfo, ObjectId, ReferenceTypeId,
        Result, ThreadId, VariableInfo, EVENT_KIND_BREAKPOINT, EVENT_KIND_CLASS_PREPARE,
        EVENT_KIND_EXCEPTION, EVENT_KIND_METHOD_ENTRY, EVENT_KIND_METHOD_EXIT,
        EVENT_KIND_SINGLE_STEP, EVENT_KIND_THREAD_DEATH, EVENT_KIND_THREAD_START,
        EVENT_KIND_VM_DEATH, EVENT_KIND_VM_START,
    },
};

#[derive(Debug, Clone)]
pub struct JdwpClientConfig {
    pub handshake_timeout: Duration,
    pub reply_timeout: Duration,
    pub event_channel_size: usize,
}

impl Default for JdwpClientConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
            // Method invocation on a paused thread can legitimately take a
            // while (user expressions run arbitrary script code).
            reply_timeout: Duration::from_secs(30),
            event_channel_size: 256,
        }
    }
}

#[derive(Debug)]
struct Reply {
    error_code: u16,
    payload: Vec<u8>,
}

#[derive(Debug)]
struct Inner {
    writer: Mutex<tokio::net::tcp::OwnedWriteHalf>,
    pending: Mutex<HashMap<u32, oneshot::Sender<std::result::Result<Reply, JdwpError>>>>,
    next_id: AtomicU32,
    id_sizes: Mutex<JdwpIdSizes>,
    events: broadcast::Sender<JdwpEvent>,
    shutdown: CancellationToken,
    config: JdwpClientConfig,
}

/// Asynchronous JDWP client.
///
/// Cheap to clone; all clones share one connection. Replies are matched to
/// commands by packet id on a background read loop, and VM events are
/// re-broadcast to every subscriber.
#[derive(Clone)]
pub struct JdwpClient {
    inner: Arc<Inner>,
}

impl JdwpClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        Self::connect_with_config(addr, JdwpClientConfig::default()).await
    }

    pub async fn connect_with_config(addr: SocketAddr, config: JdwpClientConfig) -> Result<Self> {
        let mut stream = TcpStream::connect(addr).await?;
        let _ = stream.set_nodelay(true);

        tokio::time::timeout(config.handshake_timeout, stream.write_all(HANDSHAKE))
            .await
            .map_err(|_| JdwpError::Timeout)??;

        let mut handshake = [0u8; HANDSHAKE.len()];
        tokio::time::timeout(config.handshake_timeout, stream.read_exact(&mut handshake))
            .await
            .map_err(|_| JdwpError::Timeout)??;

        if handshake != *HANDSHAKE {
            return Err(JdwpError::Protocol(format!(
                "invalid handshake reply: {:?}",
                String::from_utf8_lossy(&handshake)
            )));
        }

        let (reader, writer) = stream.into_split();
        let (events, _) = broadcast::channel(config.event_channel_size);

        let inner = Arc::new(Inner {
            writer: Mutex::new(writer),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            id_sizes: Mutex::new(JdwpIdSizes::default()),
            events,
            shutdown: CancellationToken::new(),
            config,
        });

        tokio::spawn(read_loop(reader, inner.clone()));

        let client = Self { inner };
        // ID sizes are required for correct parsing of most replies/events.
        let _ = client.idsizes().await?;

        Ok(client)
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Cancelled when the client shuts down, explicitly or because the
    /// underlying TCP connection closed.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<JdwpEvent> {
        self.inner.events.subscribe()
    }

    async fn send_command_raw(
        &self,
        command_set: u8,
        command: u8,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = self.inner.pending.lock().await;
            pending.insert(id, tx);
        }

        let packet = encode_command(id, command_set, command, &payload);
        {
            let mut writer = self.inner.writer.lock().await;
            writer.write_all(&packet).await?;
        }

        let reply = tokio::select! {
            _ = self.inner.shutdown.cancelled() => {
                self.remove_pending(id).await;
                return Err(JdwpError::Cancelled);
            }
            res = tokio::time::timeout(self.inner.config.reply_timeout, rx) => {
                match res {
                    Ok(Ok(r)) => r,
                    Ok(Err(_closed)) => return Err(JdwpError::ConnectionClosed),
                    Err(_elapsed) => {
                        self.remove_pending(id).await;
                        return Err(JdwpError::Timeout);
                    }
                }
            }
        }?;

        if reply.error_code != 0 {
            return Err(JdwpError::VmError(reply.error_code));
        }

        Ok(reply.payload)
    }

    async fn remove_pending(&self, id: u32) {
        let mut pending = self.inner.pending.lock().await;
        pending.remove(&id);
    }

    async fn id_sizes(&self) -> JdwpIdSizes {
        *self.inner.id_sizes.lock().await
    }

    /// VirtualMachine.IDSizes (1, 7)
    pub async fn idsizes(&self) -> Result<JdwpIdSizes> {
        let payload = self.send_command_raw(1, 7, Vec::new()).await?;
        let mut r = JdwpReader::new(&payload);
        let sizes = JdwpIdSizes {
            field_id: r.read_u32()? as usize,
            method_id: r.read_u32()? as usize,
            object_id: r.read_u32()? as usize,
            reference_type_id: r.read_u32()? as usize,
            frame_id: r.read_u32()? as usize,
        };
        *self.inner.id_sizes.lock().await = sizes;
        Ok(sizes)
    }

    /// VirtualMachine.AllClasses (1, 3)
    pub async fn all_classes(&self) -> Result<Vec<ClassInfo>> {
        let payload = self.send_command_raw(1, 3, Vec::new()).await?;
        let sizes = self.id_sizes().await;
        let mut r = JdwpReader::new(&payload);
        let count = r.read_u32()? as usize;
        let mut classes = Vec::with_capacity(count);
        for _ in 0..count {
            classes.push(ClassInfo {
                ref_type_tag: r.read_u8()?,
                type_id: r.read_reference_type_id(&sizes)?,
                signature: r.read_string()?,
                status: r.read_u32()?,
            });
        }
        Ok(classes)
    }

    /// VirtualMachine.AllThreads (1, 4)
    pub async fn all_threads(&self) -> Result<Vec<ThreadId>> {
        let payload = self.send_command_raw(1, 4, Vec::new()).await?;
        let sizes = self.id_sizes().await;
        let mut r = JdwpReader::new(&payload);
        let count = r.read_u32()? as usize;
        let mut threads = Vec::with_capacity(count);
        for _ in 0..count {
            threads.push(r.read_object_id(&sizes)?);
        }
        Ok(threads)
    }

    /// VirtualMachine.Suspend (1, 8)
    pub async fn vm_suspend(&self) -> Result<()> {
        let _ = self.send_command_raw(1, 8, Vec::new()).await?;
        Ok(())
    }

    /// VirtualMachine.Resume (1, 9)
    pub async fn vm_resume(&self) -> Result<()> {
        let _ = self.send_command_raw(1, 9, Vec::new()).await?;
        Ok(())
    }

    /// VirtualMachine.CreateString (1, 11)
    pub async fn create_string(&self, value: &str) -> Result<ObjectId> {
        let mut w = JdwpWriter::new();
        w.write_string(value);
        let payload = self.send_command_raw(1, 11, w.into_vec()).await?;
        let sizes = self.id_sizes().await;
        let mut r = JdwpReader::new(&payload);
        r.read_object_id(&sizes)
    }

    /// ReferenceType.Signature (2, 1)
    pub async fn reference_type_signature(&self, class_id: ReferenceTypeId) -> Result<String> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_reference_type_id(class_id, &sizes);
        let payload = self.send_command_raw(2, 1, w.into_vec()).await?;
        let mut r = JdwpReader::new(&payload);
        r.read_string()
    }

    /// ReferenceType.Fields (2, 4)
    pub async fn reference_type_fields(&self, class_id: ReferenceTypeId) -> Result<Vec<FieldInfo>> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_reference_type_id(class_id, &sizes);
        let payload = self.send_command_raw(2, 4, w.into_vec()).await?;
        let mut r = JdwpReader::new(&payload);
        let count = r.read_u32()? as usize;
        let mut fields = Vec::with_capacity(count);
        for _ in 0..count {
            fields.push(FieldInfo {
                field_id: r.read_id(sizes.field_id)?,
                name: r.read_string()?,
                signature: r.read_string()?,
                mod_bits: r.read_u32()?,
            });
        }
        Ok(fields)
    }

    /// ReferenceType.Methods (2, 5)
    pub async fn reference_type_methods(
        &self,
        class_id: ReferenceTypeId,
    ) -> Result<Vec<MethodInfo>> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_reference_type_id(class_id, &sizes);
        let payload = self.send_command_raw(2, 5, w.into_vec()).await?;
        let mut r = JdwpReader::new(&payload);
        let count = r.read_u32()? as usize;
        let mut methods = Vec::with_capacity(count);
        for _ in 0..count {
            methods.push(MethodInfo {
                method_id: r.read_id(sizes.method_id)?,
                name: r.read_string()?,
                signature: r.read_string()?,
                mod_bits: r.read_u32()?,
            });
        }
        Ok(methods)
    }

    /// ReferenceType.GetValues (2, 6) — static field reads.
    pub async fn reference_type_get_values(
        &self,
        class_id: ReferenceTypeId,
        field_ids: &[u64],
    ) -> Result<Vec<JdwpValue>> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_reference_type_id(class_id, &sizes);
        w.write_u32(field_ids.len() as u32);
        for field_id in field_ids {
            w.write_id(*field_id, sizes.field_id);
        }
        let payload = self.send_command_raw(2, 6, w.into_vec()).await?;
        let mut r = JdwpReader::new(&payload);
        let count = r.read_u32()? as usize;
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(r.read_tagged_value(&sizes)?);
        }
        Ok(values)
    }

    /// ReferenceType.SourceFile (2, 7)
    pub async fn reference_type_source_file(&self, class_id: ReferenceTypeId) -> Result<String> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_reference_type_id(class_id, &sizes);
        let payload = self.send_command_raw(2, 7, w.into_vec()).await?;
        let mut r = JdwpReader::new(&payload);
        r.read_string()
    }

    /// ReferenceType.Interfaces (2, 10)
    pub async fn reference_type_interfaces(
        &self,
        class_id: ReferenceTypeId,
    ) -> Result<Vec<ReferenceTypeId>> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_reference_type_id(class_id, &sizes);
        let payload = self.send_command_raw(2, 10, w.into_vec()).await?;
        let mut r = JdwpReader::new(&payload);
        let count = r.read_u32()? as usize;
        let mut interfaces = Vec::with_capacity(count);
        for _ in 0..count {
            interfaces.push(r.read_reference_type_id(&sizes)?);
        }
        Ok(interfaces)
    }

    /// ClassType.Superclass (3, 1)
    pub async fn class_type_superclass(
        &self,
        class_id: ReferenceTypeId,
    ) -> Result<Option<ReferenceTypeId>> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_reference_type_id(class_id, &sizes);
        let payload = self.send_command_raw(3, 1, w.into_vec()).await?;
        let mut r = JdwpReader::new(&payload);
        let superclass = r.read_reference_type_id(&sizes)?;
        Ok((superclass != 0).then_some(superclass))
    }

    /// ClassType.InvokeMethod (3, 3) — static method invocation on the
    /// (suspended) event thread. Returns the result and the thrown exception
    /// object id (0 when none).
    pub async fn class_type_invoke_method(
        &self,
        class_id: ReferenceTypeId,
        thread: ThreadId,
        method_id: MethodId,
        args: &[JdwpValue],
        options: u32,
    ) -> Result<(JdwpValue, ObjectId)> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_reference_type_id(class_id, &sizes);
        w.write_object_id(thread, &sizes);
        w.write_id(method_id, sizes.method_id);
        w.write_u32(args.len() as u32);
        for arg in args {
            w.write_tagged_value(arg, &sizes);
        }
        w.write_u32(options);
        let payload = self.send_command_raw(3, 3, w.into_vec()).await?;
        let mut r = JdwpReader::new(&payload);
        let value = r.read_tagged_value(&sizes)?;
        let _exception_tag = r.read_u8()?;
        let exception = r.read_object_id(&sizes)?;
        Ok((value, exception))
    }

    /// Method.LineTable (6, 1)
    pub async fn method_line_table(
        &self,
        class_id: ReferenceTypeId,
        method_id: MethodId,
    ) -> Result<LineTable> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_reference_type_id(class_id, &sizes);
        w.write_id(method_id, sizes.method_id);
        let payload = self.send_command_raw(6, 1, w.into_vec()).await?;
        let mut r = JdwpReader::new(&payload);
        let start = r.read_u64()?;
        let end = r.read_u64()?;
        let count = r.read_u32()? as usize;
        let mut lines = Vec::with_capacity(count);
        for _ in 0..count {
            lines.push(LineTableEntry {
                code_index: r.read_u64()?,
                line: r.read_i32()?,
            });
        }
        Ok(LineTable { start, end, lines })
    }

    /// Method.VariableTable (6, 2)
    pub async fn method_variable_table(
        &self,
        class_id: ReferenceTypeId,
        method_id: MethodId,
    ) -> Result<(u32, Vec<VariableInfo>)> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_reference_type_id(class_id, &sizes);
        w.write_id(method_id, sizes.method_id);
        let payload = self.send_command_raw(6, 2, w.into_vec()).await?;
        let mut r = JdwpReader::new(&payload);
        let arg_count = r.read_u32()?;
        let count = r.read_u32()? as usize;
        let mut vars = Vec::with_capacity(count);
        for _ in 0..count {
            vars.push(VariableInfo {
                code_index: r.read_u64()?,
                name: r.read_string()?,
                signature: r.read_string()?,
                length: r.read_u32()?,
                slot: r.read_u32()?,
            });
        }
        Ok((arg_count, vars))
    }

    /// ObjectReference.ReferenceType (9, 1)
    pub async fn object_reference_reference_type(
        &self,
        object_id: ObjectId,
    ) -> Result<ReferenceTypeId> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_object_id(object_id, &sizes);
        let payload = self.send_command_raw(9, 1, w.into_vec()).await?;
        let mut r = JdwpReader::new(&payload);
        let _ref_type_tag = r.read_u8()?;
        r.read_reference_type_id(&sizes)
    }

    /// ObjectReference.GetValues (9, 2)
    pub async fn object_reference_get_values(
        &self,
        object_id: ObjectId,
        field_ids: &[u64],
    ) -> Result<Vec<JdwpValue>> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_object_id(object_id, &sizes);
        w.write_u32(field_ids.len() as u32);
        for field_id in field_ids {
            w.write_id(*field_id, sizes.field_id);
        }
        let payload = self.send_command_raw(9, 2, w.into_vec()).await?;
        let mut r = JdwpReader::new(&payload);
        let count = r.read_u32()? as usize;
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(r.read_tagged_value(&sizes)?);
        }
        Ok(values)
    }

    /// ObjectReference.InvokeMethod (9, 6) — instance method invocation on
    /// the (suspended) event thread.
    pub async fn object_reference_invoke_method(
        &self,
        object_id: ObjectId,
        thread: ThreadId,
        class_id: ReferenceTypeId,
        method_id: MethodId,
        args: &[JdwpValue],
        options: u32,
    ) -> Result<(JdwpValue, ObjectId)> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_object_id(object_id, &sizes);
        w.write_object_id(thread, &sizes);
        w.write_reference_type_id(class_id, &sizes);
        w.write_id(method_id, sizes.method_id);
        w.write_u32(args.len() as u32);
        for arg in args {
            w.write_tagged_value(arg, &sizes);
        }
        w.write_u32(options);
        let payload = self.send_command_raw(9, 6, w.into_vec()).await?;
        let mut r = JdwpReader::new(&payload);
        let value = r.read_tagged_value(&sizes)?;
        let _exception_tag = r.read_u8()?;
        let exception = r.read_object_id(&sizes)?;
        Ok((value, exception))
    }

    /// ObjectReference.DisableCollection (9, 7)
    pub async fn object_reference_disable_collection(&self, object_id: ObjectId) -> Result<()> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_object_id(object_id, &sizes);
        let _ = self.send_command_raw(9, 7, w.into_vec()).await?;
        Ok(())
    }

    /// ObjectReference.EnableCollection (9, 8)
    pub async fn object_reference_enable_collection(&self, object_id: ObjectId) -> Result<()> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_object_id(object_id, &sizes);
        let _ = self.send_command_raw(9, 8, w.into_vec()).await?;
        Ok(())
    }

    /// StringReference.Value (10, 1)
    pub async fn string_reference_value(&self, string_id: ObjectId) -> Result<String> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_object_id(string_id, &sizes);
        let payload = self.send_command_raw(10, 1, w.into_vec()).await?;
        let mut r = JdwpReader::new(&payload);
        r.read_string()
    }

    /// ThreadReference.Name (11, 1)
    pub async fn thread_name(&self, thread: ThreadId) -> Result<String> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_object_id(thread, &sizes);
        let payload = self.send_command_raw(11, 1, w.into_vec()).await?;
        let mut r = JdwpReader::new(&payload);
        r.read_string()
    }

    /// ThreadReference.Suspend (11, 2)
    pub async fn thread_suspend(&self, thread: ThreadId) -> Result<()> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_object_id(thread, &sizes);
        let _ = self.send_command_raw(11, 2, w.into_vec()).await?;
        Ok(())
    }

    /// ThreadReference.Resume (11, 3)
    pub async fn thread_resume(&self, thread: ThreadId) -> Result<()> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_object_id(thread, &sizes);
        let _ = self.send_command_raw(11, 3, w.into_vec()).await?;
        Ok(())
    }

    /// ThreadReference.Frames (11, 6). `length` of -1 requests all frames.
    pub async fn frames(
        &self,
        thread: ThreadId,
        start: i32,
        length: i32,
    ) -> Result<Vec<FrameInfo>> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_object_id(thread, &sizes);
        w.write_i32(start);
        w.write_i32(length);
        let payload = self.send_command_raw(11, 6, w.into_vec()).await?;
        let mut r = JdwpReader::new(&payload);
        let count = r.read_u32()? as usize;
        let mut frames = Vec::with_capacity(count);
        for _ in 0..count {
            let frame_id = r.read_id(sizes.frame_id)?;
            let location = r.read_location(&sizes)?;
            frames.push(FrameInfo { frame_id, location });
        }
        Ok(frames)
    }

    /// ArrayReference.Length (13, 1)
    pub async fn array_reference_length(&self, array_id: ObjectId) -> Result<i32> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_object_id(array_id, &sizes);
        let payload = self.send_command_raw(13, 1, w.into_vec()).await?;
        let mut r = JdwpReader::new(&payload);
        r.read_i32()
    }

    /// ArrayReference.GetValues (13, 2)
    pub async fn array_reference_get_values(
        &self,
        array_id: ObjectId,
        first_index: i32,
        length: i32,
    ) -> Result<Vec<JdwpValue>> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_object_id(array_id, &sizes);
        w.write_i32(first_index);
        w.write_i32(length);
        let payload = self.send_command_raw(13, 2, w.into_vec()).await?;
        let mut r = JdwpReader::new(&payload);
        // The reply carries a single element tag followed by the values. For
        // object-element arrays each value is individually tagged again.
        let tag = r.read_u8()?;
        let count = r.read_u32()? as usize;
        let object_elements = !tag.is_ascii_uppercase() || tag == b'L';
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            if object_elements {
                values.push(r.read_tagged_value(&sizes)?);
            } else {
                values.push(r.read_value(tag, &sizes)?);
            }
        }
        Ok(values)
    }

    /// EventRequest.Set (15, 1) — returns the request id.
    pub async fn event_request_set(
        &self,
        event_kind: u8,
        suspend_policy: u8,
        modifiers: Vec<EventModifier>,
    ) -> Result<i32> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_u8(event_kind);
        w.write_u8(suspend_policy);
        w.write_u32(modifiers.len() as u32);
        for modifier in modifiers {
            modifier.encode(&mut w, &sizes);
        }
        let payload = self.send_command_raw(15, 1, w.into_vec()).await?;
        let mut r = JdwpReader::new(&payload);
        r.read_i32()
    }

    /// EventRequest.Clear (15, 2)
    pub async fn event_request_clear(&self, event_kind: u8, request_id: i32) -> Result<()> {
        let mut w = JdwpWriter::new();
        w.write_u8(event_kind);
        w.write_i32(request_id);
        let _ = self.send_command_raw(15, 2, w.into_vec()).await?;
        Ok(())
    }

    /// StackFrame.GetValues (16, 1)
    pub async fn stack_frame_get_values(
        &self,
        thread: ThreadId,
        frame_id: FrameId,
        slots: &[(u32, String)],
    ) -> Result<Vec<JdwpValue>> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_object_id(thread, &sizes);
        w.write_id(frame_id, sizes.frame_id);
        w.write_u32(slots.len() as u32);
        for (slot, signature) in slots {
            w.write_u32(*slot);
            w.write_u8(signature_to_tag(signature));
        }
        let payload = self.send_command_raw(16, 1, w.into_vec()).await?;
        let mut r = JdwpReader::new(&payload);
        let count = r.read_u32()? as usize;
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(r.read_tagged_value(&sizes)?);
        }
        Ok(values)
    }

    /// StackFrame.SetValues (16, 2)
    pub async fn stack_frame_set_values(
        &self,
        thread: ThreadId,
        frame_id: FrameId,
        values: &[(u32, JdwpValue)],
    ) -> Result<()> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_object_id(thread, &sizes);
        w.write_id(frame_id, sizes.frame_id);
        w.write_u32(values.len() as u32);
        for (slot, value) in values {
            w.write_u32(*slot);
            w.write_tagged_value(value, &sizes);
        }
        let _ = self.send_command_raw(16, 2, w.into_vec()).await?;
        Ok(())
    }

    /// StackFrame.ThisObject (16, 3) — 0 when the frame is static.
    pub async fn stack_frame_this_object(
        &self,
        thread: ThreadId,
        frame_id: FrameId,
    ) -> Result<ObjectId> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_object_id(thread, &sizes);
        w.write_id(frame_id, sizes.frame_id);
        let payload = self.send_command_raw(16, 3, w.into_vec()).await?;
        let mut r = JdwpReader::new(&payload);
        let _tag = r.read_u8()?;
        r.read_object_id(&sizes)
    }
}

#[derive(Debug)]
pub enum EventModifier {
    Count {
        count: u32,
    },
    ThreadOnly {
        thread: ThreadId,
    },
    ClassOnly {
        class_id: ReferenceTypeId,
    },
    ClassMatch {
        pattern: String,
    },
    ClassExclude {
        pattern: String,
    },
    LocationOnly {
        location: Location,
    },
    ExceptionOnly {
        exception_or_null: ReferenceTypeId,
        caught: bool,
        uncaught: bool,
    },
    Step {
        thread: ThreadId,
        size: u32,
        depth: u32,
    },
}

impl EventModifier {
    fn encode(self, w: &mut JdwpWriter, sizes: &JdwpIdSizes) {
        match self {
            EventModifier::Count { count } => {
                w.write_u8(1);
                w.write_u32(count);
            }
            EventModifier::ThreadOnly { thread } => {
                w.write_u8(3);
                w.write_object_id(thread, sizes);
            }
            EventModifier::ClassOnly { class_id } => {
                w.write_u8(4);
                w.write_reference_type_id(class_id, sizes);
            }
            EventModifier::ClassMatch { pattern } => {
                w.write_u8(5);
                w.write_string(&pattern);
            }
            EventModifier::ClassExclude { pattern } => {
                w.write_u8(6);
                w.write_string(&pattern);
            }
            EventModifier::LocationOnly { location } => {
                w.write_u8(7);
                w.write_location(&location, sizes);
            }
            EventModifier::ExceptionOnly {
                exception_or_null,
                caught,
                uncaught,
            } => {
                w.write_u8(8);
                w.write_reference_type_id(exception_or_null, sizes);
                w.write_bool(caught);
                w.write_bool(uncaught);
            }
            EventModifier::Step {
                thread,
                size,
                depth,
            } => {
                w.write_u8(10);
                w.write_object_id(thread, sizes);
                w.write_u32(size);
                w.write_u32(depth);
            }
        }
    }
}

async fn read_loop(mut reader: tokio::net::tcp::OwnedReadHalf, inner: Arc<Inner>) {
    let mut saw_vm_death = false;

    loop {
        let mut header = [0u8; HEADER_LEN];
        let header_read = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            res = reader.read_exact(&mut header) => res,
        };
        if header_read.is_err() {
            break;
        }

        let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if length < HEADER_LEN {
            break;
        }

        let id = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        let flags = header[8];
        let mut payload = vec![0u8; length - HEADER_LEN];
        let payload_read = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            res = reader.read_exact(&mut payload) => res,
        };
        if payload_read.is_err() {
            break;
        }

        if (flags & FLAG_REPLY) != 0 {
            let error_code = u16::from_be_bytes([header[9], header[10]]);
            let tx = {
                let mut pending = inner.pending.lock().await;
                pending.remove(&id)
            };
            if let Some(tx) = tx {
                let _ = tx.send(Ok(Reply {
                    error_code,
                    payload,
                }));
            }
        } else {
            let command_set = header[9];
            let command = header[10];
            if command_set == 64 && command == 100 {
                match handle_event_packet(&inner, &payload).await {
                    Ok(vm_death) => saw_vm_death |= vm_death,
                    Err(err) => {
                        tracing::warn!(target: "tern.jdwp", error = %err, "malformed event packet");
                        break;
                    }
                }
            } else {
                // We don't implement VM->debugger commands other than events.
                let _ = (id, command_set, command, payload);
            }
        }
    }

    if !saw_vm_death {
        let _ = inner.events.send(JdwpEvent::VmDisconnected);
    }
    inner.shutdown.cancel();

    let pending = {
        let mut pending = inner.pending.lock().await;
        std::mem::take(&mut *pending)
    };
    for (_id, tx) in pending {
        let _ = tx.send(Err(JdwpError::ConnectionClosed));
    }
}

/// Decode one composite event packet, broadcasting each event. Returns
/// whether a `VmDeath` was seen.
async fn handle_event_packet(inner: &Inner, payload: &[u8]) -> Result<bool> {
    let sizes = *inner.id_sizes.lock().await;
    let mut r = JdwpReader::new(payload);
    let _suspend_policy = r.read_u8()?;
    let event_count = r.read_u32()? as usize;
    let mut saw_vm_death = false;
    for _ in 0..event_count {
        let kind = r.read_u8()?;
        let request_id = r.read_i32()?;
        let event = match kind {
            EVENT_KIND_SINGLE_STEP => {
                let thread = r.read_object_id(&sizes)?;
                let location = r.read_location(&sizes)?;
                JdwpEvent::SingleStep {
                    request_id,
                    thread,
                    location,
                }
            }
            EVENT_KIND_BREAKPOINT => {
                let thread = r.read_object_id(&sizes)?;
                let location = r.read_location(&sizes)?;
                JdwpEvent::Breakpoint {
                    request_id,
                    thread,
                    location,
                }
            }
            EVENT_KIND_METHOD_ENTRY => {
                let thread = r.read_object_id(&sizes)?;
                let location = r.read_location(&sizes)?;
                JdwpEvent::MethodEntry {
                    request_id,
                    thread,
                    location,
                }
            }
            EVENT_KIND_METHOD_EXIT => {
                let thread = r.read_object_id(&sizes)?;
                let location = r.read_location(&sizes)?;
                JdwpEvent::MethodExit {
                    request_id,
                    thread,
                    location,
                }
            }
            EVENT_KIND_EXCEPTION => {
                let thread = r.read_object_id(&sizes)?;
                let location = r.read_location(&sizes)?;
                let _exception_tag = r.read_u8()?;
                let exception = r.read_object_id(&sizes)?;
                let catch_loc = r.read_location(&sizes)?;
                let catch_location = (catch_loc.type_tag != 0
                    || catch_loc.class_id != 0
                    || catch_loc.method_id != 0
                    || catch_loc.index != 0)
                    .then_some(catch_loc);
                JdwpEvent::Exception {
                    request_id,
                    thread,
                    location,
                    exception,
                    catch_location,
                }
            }
            EVENT_KIND_CLASS_PREPARE => {
                let thread = r.read_object_id(&sizes)?;
                let ref_type_tag = r.read_u8()?;
                let type_id = r.read_reference_type_id(&sizes)?;
                let signature = r.read_string()?;
                let status = r.read_u32()?;
                JdwpEvent::ClassPrepare {
                    request_id,
                    thread,
                    ref_type_tag,
                    type_id,
                    signature,
                    status,
                }
            }
            EVENT_KIND_THREAD_START => {
                let thread = r.read_object_id(&sizes)?;
                JdwpEvent::ThreadStart { request_id, thread }
            }
            EVENT_KIND_THREAD_DEATH => {
                let thread = r.read_object_id(&sizes)?;
                JdwpEvent::ThreadDeath { request_id, thread }
            }
            EVENT_KIND_VM_START => {
                let thread = r.read_object_id(&sizes)?;
                JdwpEvent::VmStart { request_id, thread }
            }
            EVENT_KIND_VM_DEATH => {
                saw_vm_death = true;
                JdwpEvent::VmDeath
            }
            _ => {
                // Unknown event kind: we cannot know its wire size, so skip
                // the remainder of this composite packet.
                return Ok(saw_vm_death);
            }
        };
        let _ = inner.events.send(event);
    }
    Ok(saw_vm_death)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::mock::{
        MockClass, MockFrame, MockJdwpServer, MockMethod, MockObject, MockThread, MockVmConfig,
    };
    use crate::types::{EVENT_KIND_BREAKPOINT, TAG_INT, TAG_STRING};

    const THREAD: u64 = 0x1001;
    const FRAME: u64 = 0x2001;
    const CLASS: u64 = 0x3001;
    const METHOD: u64 = 0x4001;
    const STRING_OBJ: u64 = 0x5001;

    fn world() -> MockVmConfig {
        let mut class = MockClass::new(CLASS, "Lcom/example/Main;");
        class.source_file = Some("Main.java".to_string());
        let mut method = MockMethod::named(METHOD, "main");
        method.line_table = Some(LineTable {
            start: 0,
            end: 20,
            lines: vec![
                LineTableEntry {
                    code_index: 0,
                    line: 3,
                },
                LineTableEntry {
                    code_index: 10,
                    line: 4,
                },
            ],
        });
        method.variables = vec![VariableInfo {
            code_index: 0,
            name: "count".to_string(),
            signature: "I".to_string(),
            length: 100,
            slot: 1,
        }];
        class.methods.push(method);

        let mut locals = HashMap::new();
        locals.insert(1, JdwpValue::Int(42));

        MockVmConfig {
            id_sizes: JdwpIdSizes::default(),
            classes: vec![class],
            objects: vec![(STRING_OBJ, MockObject::string(0, "mock string"))],
            threads: vec![MockThread {
                id: THREAD,
                name: "main".to_string(),
                frames: vec![MockFrame {
                    frame_id: FRAME,
                    location: Location {
                        type_tag: 1,
                        class_id: CLASS,
                        method_id: METHOD,
                        index: 0,
                    },
                    this_object: 0,
                    locals,
                }],
            }],
        }
    }

    #[tokio::test]
    async fn handshake_and_basic_introspection() {
        let server = MockJdwpServer::spawn_with_config(world()).await.unwrap();
        let client = JdwpClient::connect(server.addr()).await.unwrap();

        let classes = client.all_classes().await.unwrap();
        assert_eq!(classes.len(), 1);
        assert_eq!(classes[0].signature, "Lcom/example/Main;");

        let threads = client.all_threads().await.unwrap();
        assert_eq!(threads, vec![THREAD]);
        assert_eq!(client.thread_name(THREAD).await.unwrap(), "main");

        let frames = client.frames(THREAD, 0, -1).await.unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].location.class_id, CLASS);

        let table = client.method_line_table(CLASS, METHOD).await.unwrap();
        assert_eq!(table.lines.len(), 2);

        let (_argc, vars) = client.method_variable_table(CLASS, METHOD).await.unwrap();
        assert_eq!(vars.len(), 1);
        assert_eq!(vars[0].name, "count");

        let value = client.string_reference_value(STRING_OBJ).await.unwrap();
        assert_eq!(value, "mock string");
    }

    #[tokio::test]
    async fn frame_slots_read_and_write() {
        let server = MockJdwpServer::spawn_with_config(world()).await.unwrap();
        let client = JdwpClient::connect(server.addr()).await.unwrap();

        let values = client
            .stack_frame_get_values(THREAD, FRAME, &[(1, "I".to_string())])
            .await
            .unwrap();
        assert_eq!(values, vec![JdwpValue::Int(42)]);

        client
            .stack_frame_set_values(THREAD, FRAME, &[(1, JdwpValue::Int(7))])
            .await
            .unwrap();
        assert_eq!(
            server.frame_local(THREAD, FRAME, 1),
            Some(JdwpValue::Int(7))
        );

        // A slot the frame never materialized fails the whole batch.
        let err = client
            .stack_frame_get_values(THREAD, FRAME, &[(9, "I".to_string())])
            .await
            .unwrap_err();
        assert_eq!(err.vm_error_code(), Some(crate::types::ERROR_INVALID_SLOT));
    }

    #[tokio::test]
    async fn breakpoint_events_reach_subscribers() {
        let server = MockJdwpServer::spawn_with_config(world()).await.unwrap();
        let client = JdwpClient::connect(server.addr()).await.unwrap();
        let mut events = client.subscribe_events();

        let location = Location {
            type_tag: 1,
            class_id: CLASS,
            method_id: METHOD,
            index: 10,
        };
        let request_id = client
            .event_request_set(
                EVENT_KIND_BREAKPOINT,
                1,
                vec![EventModifier::LocationOnly { location }],
            )
            .await
            .unwrap();

        let emitted = server.emit_breakpoint(THREAD, location).await;
        assert_eq!(emitted, Some(request_id));

        match events.recv().await.unwrap() {
            JdwpEvent::Breakpoint {
                request_id: seen,
                thread,
                location: at,
            } => {
                assert_eq!(seen, request_id);
                assert_eq!(thread, THREAD);
                assert_eq!(at, location);
            }
            other => panic!("expected a breakpoint event, got {other:?}"),
        }

        client
            .event_request_clear(EVENT_KIND_BREAKPOINT, request_id)
            .await
            .unwrap();
        assert!(server.emit_breakpoint(THREAD, location).await.is_none());
    }

    #[tokio::test]
    async fn scripted_invocations_and_created_strings() {
        let server = MockJdwpServer::spawn_with_config(world()).await.unwrap();
        let client = JdwpClient::connect(server.addr()).await.unwrap();

        let code_id = client.create_string("1 + 2").await.unwrap();
        assert!(server
            .created_strings()
            .iter()
            .any(|(id, text)| *id == code_id && text == "1 + 2"));

        server.push_invoke_reply(CLASS, METHOD, JdwpValue::Int(3), 0);
        let (value, exception) = client
            .class_type_invoke_method(
                CLASS,
                THREAD,
                METHOD,
                &[JdwpValue::Object {
                    tag: TAG_STRING,
                    id: code_id,
                }],
                0,
            )
            .await
            .unwrap();
        assert_eq!(exception, 0);
        assert_eq!(value, JdwpValue::Int(3));

        let invocations = server.invocations();
        let call = invocations.last().unwrap();
        assert_eq!(call.method_name, "main");
        assert_eq!(call.string_args, vec![Some("1 + 2".to_string())]);
    }

    #[tokio::test]
    async fn disconnect_synthesizes_a_terminal_event() {
        let server = MockJdwpServer::spawn_with_config(world()).await.unwrap();
        let client = JdwpClient::connect(server.addr()).await.unwrap();
        let mut events = client.subscribe_events();

        server.drop_connection().await;

        match events.recv().await.unwrap() {
            JdwpEvent::VmDisconnected => {}
            other => panic!("expected VmDisconnected, got {other:?}"),
        }
        assert!(client.shutdown_token().is_cancelled());

        let err = client.all_threads().await.unwrap_err();
        assert!(matches!(
            err,
            JdwpError::Cancelled | JdwpError::ConnectionClosed | JdwpError::Io(_)
        ));
    }
}
