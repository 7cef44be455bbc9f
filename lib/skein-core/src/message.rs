//! Tagged, reference-counted records.
//!
//! A [`Message`] is the unit of exchange across the runtime: control signals delivered to a task's own port, work
//! items flowing through a process chain, and progress events sent to watchers are all messages. A message is an
//! integer discriminant (`what`), an insertion-ordered map of named, typed fields, and one anonymous positional `data`
//! slot.
//!
//! Cloning a message takes a new reference to the same record. Setters use copy-on-write, so a record that is shared
//! between several holders is never mutated in place: the writer ends up with a private copy and every other holder
//! keeps seeing the original values.
use std::{
    any::Any,
    fmt,
    sync::{Arc, Weak},
};

use bytes::{Buf, BufMut as _, Bytes, BytesMut};
use indexmap::IndexMap;
use snafu::Snafu;

const TAG_INT: u16 = 1;
const TAG_FLOAT: u16 = 2;
const TAG_STRING: u16 = 3;
const TAG_BOOL: u16 = 4;
const TAG_LONG: u16 = 5;
const TAG_HANDLE: u16 = 6;

/// An opaque, shareable handle to an arbitrary value.
///
/// Handles are compared by identity: two handles are equal only if they point at the same allocation.
#[derive(Clone)]
pub struct Handle(Arc<dyn Any + Send + Sync>);

impl Handle {
    /// Creates a new handle wrapping the given value.
    pub fn new<T>(value: T) -> Self
    where
        T: Any + Send + Sync,
    {
        Self(Arc::new(value))
    }

    /// Creates a new handle from an existing shared value.
    pub fn from_arc<T>(value: Arc<T>) -> Self
    where
        T: Any + Send + Sync,
    {
        Self(value)
    }

    /// Returns a reference to the wrapped value if it is of type `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    /// Returns `true` if both handles point at the same value.
    pub fn ptr_eq(&self, other: &Handle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    fn address(&self) -> u64 {
        Arc::as_ptr(&self.0) as *const () as usize as u64
    }
}

impl PartialEq for Handle {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({:#x})", self.address())
    }
}

/// A typed message field value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// A 32-bit signed integer.
    Int(i32),

    /// A 64-bit signed integer.
    Long(i64),

    /// A 32-bit float.
    Float(f32),

    /// A boolean.
    Bool(bool),

    /// A UTF-8 string.
    String(String),

    /// An opaque handle.
    Handle(Handle),
}

impl Value {
    /// Returns the name of this value's type.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Long(_) => "long",
            Value::Float(_) => "float",
            Value::Bool(_) => "bool",
            Value::String(_) => "string",
            Value::Handle(_) => "handle",
        }
    }

    fn type_tag(&self) -> u16 {
        match self {
            Value::Int(_) => TAG_INT,
            Value::Float(_) => TAG_FLOAT,
            Value::String(_) => TAG_STRING,
            Value::Bool(_) => TAG_BOOL,
            Value::Long(_) => TAG_LONG,
            Value::Handle(_) => TAG_HANDLE,
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            Value::Int(_) | Value::Float(_) | Value::Bool(_) => 4,
            Value::Long(_) | Value::Handle(_) => 8,
            Value::String(s) => 4 + s.len(),
        }
    }

    fn encode(&self, name: &str, buf: &mut BytesMut) -> Result<(), FramingError> {
        match self {
            Value::Int(v) => buf.put_i32(*v),
            Value::Float(v) => buf.put_f32(*v),
            Value::Bool(v) => buf.put_u32(u32::from(*v)),
            Value::Long(v) => buf.put_i64(*v),
            Value::Handle(h) => buf.put_u64(h.address()),
            Value::String(s) => {
                buf.put_u32(frame_len(name, s.len())?);
                buf.put_slice(s.as_bytes());
            }
        }
        Ok(())
    }
}

/// Converts a name or string length into its 4-byte frame prefix.
fn frame_len(name: &str, len: usize) -> Result<u32, FramingError> {
    u32::try_from(len).map_err(|_| FramingError::TooLong {
        name: name.to_string(),
        len,
    })
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Long(value)
    }
}

impl From<f32> for Value {
    fn from(value: f32) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<Handle> for Value {
    fn from(value: Handle) -> Self {
        Value::Handle(value)
    }
}

/// A framing error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum FramingError {
    /// The frame ended before a complete value could be read.
    #[snafu(display("Frame truncated at offset {}: needed {} more bytes.", offset, needed))]
    Truncated {
        /// Offset into the frame at which the read was attempted.
        offset: usize,

        /// Number of bytes that were missing.
        needed: usize,
    },

    /// A field carried a type tag that does not correspond to any value type.
    #[snafu(display("Unknown type tag {} for field '{}'.", tag, name))]
    UnknownTypeTag {
        /// Name of the field.
        name: String,

        /// The unrecognized tag.
        tag: u16,
    },

    /// A field name or string value was not valid UTF-8.
    #[snafu(display("Invalid UTF-8 in frame."))]
    InvalidUtf8 {
        /// Error source.
        source: std::string::FromUtf8Error,
    },

    /// A field name or string value is longer than a 4-byte length prefix can describe.
    #[snafu(display("Field '{}' is {} bytes long, which does not fit in a frame.", name, len))]
    TooLong {
        /// Name of the field.
        name: String,

        /// Length, in bytes, of the name or value.
        len: usize,
    },

    /// A field carried an opaque handle, which only has meaning inside the process that framed it.
    #[snafu(display("Field '{}' holds an opaque handle and cannot be decoded.", name))]
    OpaqueHandle {
        /// Name of the field.
        name: String,
    },
}

#[derive(Clone)]
struct Record {
    what: i32,
    fields: IndexMap<String, Value>,
    data: Option<Value>,
}

/// A tagged, reference-counted record of named fields.
#[derive(Clone)]
pub struct Message {
    record: Arc<Record>,
}

macro_rules! typed_accessors {
    ($($get:ident, $set:ident, $variant:ident, $ty:ty, $desc:literal);+ $(;)?) => {
        $(
            #[doc = concat!("Gets the ", $desc, " field `name`.")]
            ///
            /// # Panics
            ///
            /// Panics if the field is absent or holds a value of another type.
            pub fn $get(&self, name: &str) -> $ty {
                match self.field(name) {
                    Value::$variant(v) => v.clone(),
                    other => wrong_type(name, stringify!($variant), other),
                }
            }

            #[doc = concat!("Sets the ", $desc, " field `name`, replacing any existing value.")]
            pub fn $set<N: Into<String>>(&mut self, name: N, value: $ty) {
                self.set_value(name, Value::$variant(value));
            }
        )+
    };
}

impl Message {
    /// Creates an empty message with the given discriminant.
    pub fn new(what: i32) -> Self {
        Self {
            record: Arc::new(Record {
                what,
                fields: IndexMap::new(),
                data: None,
            }),
        }
    }

    /// Creates a message with the given discriminant and fields.
    ///
    /// Fields are set in iteration order.
    pub fn new_full<I, N, V>(what: i32, fields: I) -> Self
    where
        I: IntoIterator<Item = (N, V)>,
        N: Into<String>,
        V: Into<Value>,
    {
        let mut message = Self::new(what);
        for (name, value) in fields {
            message.set_value(name, value);
        }
        message
    }

    /// Creates a message with the given discriminant and `data` slot.
    pub fn with_data<V: Into<Value>>(what: i32, data: V) -> Self {
        let mut message = Self::new(what);
        message.set_data(data);
        message
    }

    /// Returns the message discriminant.
    pub fn what(&self) -> i32 {
        self.record.what
    }

    /// Returns the number of live references to this record.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.record)
    }

    /// Creates a weak reference to this record, which does not keep it alive.
    pub fn downgrade(&self) -> WeakMessage {
        WeakMessage {
            record: Arc::downgrade(&self.record),
        }
    }

    /// Creates an independent copy of this message.
    ///
    /// The copy has its own field map and a reference count of one.
    pub fn copy(&self) -> Message {
        Self {
            record: Arc::new(Record::clone(&self.record)),
        }
    }

    fn record_mut(&mut self) -> &mut Record {
        Arc::make_mut(&mut self.record)
    }

    fn field(&self, name: &str) -> &Value {
        match self.record.fields.get(name) {
            Some(value) => value,
            None => panic!("message field '{}' is absent (what={})", name, self.record.what),
        }
    }

    /// Gets the value of the field `name`, if present.
    pub fn get_value(&self, name: &str) -> Option<&Value> {
        self.record.fields.get(name)
    }

    /// Sets the field `name`, replacing any existing value while keeping its position.
    ///
    /// # Panics
    ///
    /// Panics if `name` is empty: the empty name is reserved for the `data` slot in framed messages.
    pub fn set_value<N, V>(&mut self, name: N, value: V)
    where
        N: Into<String>,
        V: Into<Value>,
    {
        let name = name.into();
        assert!(!name.is_empty(), "message field names must not be empty");
        self.record_mut().fields.insert(name, value.into());
    }

    typed_accessors! {
        get_int, set_int, Int, i32, "32-bit integer";
        get_long, set_long, Long, i64, "64-bit integer";
        get_float, set_float, Float, f32, "32-bit float";
        get_bool, set_bool, Bool, bool, "boolean";
        get_string, set_string, String, String, "string";
        get_handle, set_handle, Handle, Handle, "handle";
    }

    /// Gets the `data` slot.
    ///
    /// # Panics
    ///
    /// Panics if the `data` slot is unset.
    pub fn data(&self) -> &Value {
        match &self.record.data {
            Some(value) => value,
            None => panic!("message data slot is unset (what={})", self.record.what),
        }
    }

    /// Gets the `data` slot, if set.
    pub fn get_data(&self) -> Option<&Value> {
        self.record.data.as_ref()
    }

    /// Sets the `data` slot.
    pub fn set_data<V: Into<Value>>(&mut self, value: V) {
        self.record_mut().data = Some(value.into());
    }

    /// Returns `true` if the field `name` is present.
    pub fn contains(&self, name: &str) -> bool {
        self.record.fields.contains_key(name)
    }

    /// Returns the number of named fields.
    pub fn count_names(&self) -> usize {
        self.record.fields.len()
    }

    /// Returns `true` if the message has no named fields and no `data`.
    pub fn is_empty(&self) -> bool {
        self.record.fields.is_empty() && self.record.data.is_none()
    }

    /// Returns the field names in insertion order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.record.fields.keys().map(String::as_str)
    }

    /// Returns the length, in bytes, of this message's diagnostic framing.
    ///
    /// The framing is: 4 bytes for `what`, then per field in insertion order a 4-byte name length, the name bytes, a
    /// 2-byte type tag and the value bytes. Integers, floats and booleans take 4 bytes, longs and handles take 8, and
    /// strings take a 4-byte length followed by their UTF-8 bytes. A set `data` slot is framed last, as a field with
    /// an empty name. All integers are big-endian.
    pub fn flattened_size(&self) -> usize {
        let fields = self
            .record
            .fields
            .iter()
            .map(|(name, value)| 4 + name.len() + 2 + value.encoded_len())
            .sum::<usize>();
        let data = self.record.data.as_ref().map_or(0, |value| 4 + 2 + value.encoded_len());

        4 + fields + data
    }

    /// Frames this message.
    ///
    /// See [`flattened_size`][Self::flattened_size] for the layout.
    ///
    /// # Errors
    ///
    /// If a field name or string value is longer than `u32::MAX` bytes, an error is returned.
    pub fn flatten(&self) -> Result<Bytes, FramingError> {
        let mut buf = BytesMut::with_capacity(self.flattened_size());
        buf.put_i32(self.record.what);
        for (name, value) in &self.record.fields {
            buf.put_u32(frame_len(name, name.len())?);
            buf.put_slice(name.as_bytes());
            buf.put_u16(value.type_tag());
            value.encode(name, &mut buf)?;
        }
        if let Some(value) = &self.record.data {
            buf.put_u32(0);
            buf.put_u16(value.type_tag());
            value.encode("", &mut buf)?;
        }
        Ok(buf.freeze())
    }

    /// Decodes a message from its diagnostic framing.
    ///
    /// # Errors
    ///
    /// If the frame is truncated, carries an unknown type tag or invalid UTF-8, or holds an opaque handle, an error
    /// is returned.
    pub fn unflatten(frame: &[u8]) -> Result<Message, FramingError> {
        let mut reader = FrameReader { frame, offset: 0 };

        let mut message = Message::new(reader.read_i32()?);
        while reader.has_remaining() {
            let name_len = reader.read_u32()? as usize;
            let name = reader.read_string(name_len)?;
            let tag = reader.read_u16()?;
            let value = match tag {
                TAG_INT => Value::Int(reader.read_i32()?),
                TAG_FLOAT => Value::Float(f32::from_bits(reader.read_u32()?)),
                TAG_BOOL => Value::Bool(reader.read_u32()? != 0),
                TAG_LONG => Value::Long(reader.read_u64()? as i64),
                TAG_STRING => {
                    let len = reader.read_u32()? as usize;
                    Value::String(reader.read_string(len)?)
                }
                TAG_HANDLE => return Err(FramingError::OpaqueHandle { name }),
                tag => return Err(FramingError::UnknownTypeTag { name, tag }),
            };

            if name.is_empty() {
                message.set_data(value);
            } else {
                message.set_value(name, value);
            }
        }

        Ok(message)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("what", &self.record.what)
            .field("fields", &self.record.fields)
            .field("data", &self.record.data)
            .finish()
    }
}

/// A weak reference to a message record.
///
/// Used to observe when the last strong reference to a record is released.
#[derive(Clone)]
pub struct WeakMessage {
    record: Weak<Record>,
}

impl WeakMessage {
    /// Returns `true` if the record has not yet been deallocated.
    pub fn is_alive(&self) -> bool {
        self.record.strong_count() > 0
    }

    /// Attempts to take a new strong reference to the record.
    pub fn upgrade(&self) -> Option<Message> {
        self.record.upgrade().map(|record| Message { record })
    }
}

struct FrameReader<'a> {
    frame: &'a [u8],
    offset: usize,
}

impl FrameReader<'_> {
    fn has_remaining(&self) -> bool {
        self.frame.has_remaining()
    }

    fn ensure(&self, len: usize) -> Result<(), FramingError> {
        if self.frame.remaining() < len {
            Err(FramingError::Truncated {
                offset: self.offset,
                needed: len - self.frame.remaining(),
            })
        } else {
            Ok(())
        }
    }

    fn read_u16(&mut self) -> Result<u16, FramingError> {
        self.ensure(2)?;
        self.offset += 2;
        Ok(self.frame.get_u16())
    }

    fn read_u32(&mut self) -> Result<u32, FramingError> {
        self.ensure(4)?;
        self.offset += 4;
        Ok(self.frame.get_u32())
    }

    fn read_i32(&mut self) -> Result<i32, FramingError> {
        self.ensure(4)?;
        self.offset += 4;
        Ok(self.frame.get_i32())
    }

    fn read_u64(&mut self) -> Result<u64, FramingError> {
        self.ensure(8)?;
        self.offset += 8;
        Ok(self.frame.get_u64())
    }

    fn read_string(&mut self, len: usize) -> Result<String, FramingError> {
        self.ensure(len)?;
        self.offset += len;
        let bytes = self.frame.copy_to_bytes(len);
        String::from_utf8(bytes.to_vec()).map_err(|source| FramingError::InvalidUtf8 { source })
    }
}

#[track_caller]
fn wrong_type(name: &str, expected: &str, actual: &Value) -> ! {
    panic!(
        "message field '{}' holds a {} value, expected {}",
        name,
        actual.type_name(),
        expected.to_lowercase()
    )
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn new_message_has_single_reference() {
        let message = Message::new(7);
        assert_eq!(message.ref_count(), 1);
        assert_eq!(message.what(), 7);
        assert!(message.is_empty());
        assert_eq!(message.count_names(), 0);
    }

    #[test]
    fn ref_and_unref_are_exact() {
        let message = Message::new(1);
        let weak = message.downgrade();

        let second = message.clone();
        assert_eq!(message.ref_count(), 2);
        let third = second.clone();
        assert_eq!(message.ref_count(), 3);

        drop(third);
        assert_eq!(message.ref_count(), 2);
        drop(second);
        assert_eq!(message.ref_count(), 1);

        assert!(weak.is_alive());
        drop(message);
        assert!(!weak.is_alive());
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn copy_is_independent() {
        let mut original = Message::new_full(1, [("id", Value::Int(1)), ("name", Value::from("first"))]);
        let mut copy = original.copy();
        assert_eq!(copy.ref_count(), 1);
        assert_eq!(original.ref_count(), 1);

        copy.set_int("id", 2);
        copy.set_string("extra", "x".to_string());
        assert_eq!(original.get_int("id"), 1);
        assert!(!original.contains("extra"));

        original.set_string("name", "changed".to_string());
        assert_eq!(copy.get_string("name"), "first");
    }

    #[test]
    fn shared_record_is_copied_on_write() {
        let original = Message::new_full(1, [("id", 1)]);
        let mut writer = original.clone();
        writer.set_int("id", 2);

        assert_eq!(original.get_int("id"), 1);
        assert_eq!(writer.get_int("id"), 2);
        assert_eq!(original.ref_count(), 1);
        assert_eq!(writer.ref_count(), 1);
    }

    #[test]
    fn fields_keep_insertion_order() {
        let mut message = Message::new(0);
        message.set_int("b", 1);
        message.set_int("a", 2);
        message.set_int("b", 3);
        assert_eq!(message.names().collect::<Vec<_>>(), vec!["b", "a"]);
        assert_eq!(message.get_int("b"), 3);
    }

    #[test]
    #[should_panic(expected = "is absent")]
    fn reading_absent_field_panics() {
        Message::new(0).get_int("missing");
    }

    #[test]
    #[should_panic(expected = "holds a string value")]
    fn reading_wrong_type_panics() {
        let message = Message::new_full(0, [("name", "x")]);
        message.get_int("name");
    }

    #[test]
    fn data_slot() {
        let mut message = Message::new(0);
        assert!(message.get_data().is_none());
        message.set_data(5);
        assert_eq!(message.data(), &Value::Int(5));
        assert!(!message.is_empty());
        assert_eq!(message.count_names(), 0);
    }

    #[test]
    fn handles_compare_by_identity() {
        let a = Handle::new(5u32);
        let b = Handle::new(5u32);
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
        assert_eq!(a.downcast_ref::<u32>(), Some(&5));
        assert!(a.downcast_ref::<u64>().is_none());
    }

    #[test]
    fn flattened_size_matches_framing() {
        let message = Message::new_full(3, [("id", Value::Int(42)), ("name", Value::from("123456789"))]);
        assert_eq!(message.flattened_size(), 4 + (4 + 2 + 2 + 4) + (4 + 4 + 2 + 4 + 9));
        assert_eq!(message.flatten().unwrap().len(), message.flattened_size());
    }

    #[test]
    fn flatten_layout() {
        let mut message = Message::new_full(1, [("id", Value::Int(2))]);
        message.set_data(true);

        let expected: Vec<u8> = vec![
            0, 0, 0, 1, // what
            0, 0, 0, 2, b'i', b'd', 0, 1, 0, 0, 0, 2, // "id": int 2
            0, 0, 0, 0, 0, 4, 0, 0, 0, 1, // data: bool true
        ];
        similar_asserts::assert_eq!(message.flatten().unwrap().to_vec(), expected);
    }

    #[test]
    fn unflatten_restores_fields() {
        let mut message = Message::new_full(
            9,
            [
                ("int", Value::Int(-4)),
                ("long", Value::Long(1 << 40)),
                ("float", Value::Float(1.5)),
                ("bool", Value::Bool(true)),
                ("string", Value::from("héllo")),
            ],
        );
        message.set_data("payload");

        let decoded = Message::unflatten(&message.flatten().unwrap()).expect("frame should decode");
        assert_eq!(decoded.what(), 9);
        assert_eq!(decoded.names().collect::<Vec<_>>(), message.names().collect::<Vec<_>>());
        assert_eq!(decoded.get_long("long"), 1 << 40);
        assert_eq!(decoded.get_string("string"), "héllo");
        assert_eq!(decoded.data(), &Value::from("payload"));
    }

    #[test]
    fn unflatten_rejects_bad_frames() {
        let message = Message::new_full(1, [("name", "abc")]);
        let frame = message.flatten().unwrap();
        assert!(matches!(
            Message::unflatten(&frame[..frame.len() - 1]),
            Err(FramingError::Truncated { needed: 1, .. })
        ));

        let handle = Message::new_full(1, [("h", Handle::new(()))]);
        assert!(matches!(
            Message::unflatten(&handle.flatten().unwrap()),
            Err(FramingError::OpaqueHandle { .. })
        ));

        let mut bogus = Message::new_full(1, [("x", 1)]).flatten().unwrap().to_vec();
        bogus[10] = 99;
        assert!(matches!(
            Message::unflatten(&bogus),
            Err(FramingError::UnknownTypeTag { tag: 99, .. })
        ));
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn oversize_lengths_are_rejected() {
        assert_eq!(frame_len("name", 5).unwrap(), 5);
        assert_eq!(frame_len("name", u32::MAX as usize).unwrap(), u32::MAX);

        match frame_len("name", u32::MAX as usize + 1) {
            Err(FramingError::TooLong { name, len }) => {
                assert_eq!(name, "name");
                assert_eq!(len, u32::MAX as usize + 1);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    proptest! {
        #[test]
        fn int_set_get(v in any::<i32>()) {
            let mut message = Message::new(0);
            message.set_int("v", v);
            prop_assert_eq!(message.get_int("v"), v);
        }

        #[test]
        fn long_set_get(v in any::<i64>()) {
            let mut message = Message::new(0);
            message.set_long("v", v);
            prop_assert_eq!(message.get_long("v"), v);
        }

        #[test]
        fn float_set_get(v in any::<f32>()) {
            let mut message = Message::new(0);
            message.set_float("v", v);
            prop_assert_eq!(message.get_float("v").to_bits(), v.to_bits());
        }

        #[test]
        fn bool_set_get(v in any::<bool>()) {
            let mut message = Message::new(0);
            message.set_bool("v", v);
            prop_assert_eq!(message.get_bool("v"), v);
        }

        #[test]
        fn string_set_get(v in ".*") {
            let mut message = Message::new(0);
            message.set_string("v", v.clone());
            prop_assert_eq!(message.get_string("v"), v.clone());
            prop_assert_eq!(message.flattened_size(), 4 + 4 + 1 + 2 + 4 + v.len());
        }
    }
}
