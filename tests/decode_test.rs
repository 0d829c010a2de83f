//! Wire decoding tests: the concrete scenarios plus the round-trip laws
//! and boundary behaviors of the parser VM.

use rapidpb::{
    compile, CompileOptions, DescriptorPool, ErrorCode, FieldDescriptor, Kind, MapKey,
    MessageDescriptor, Shared, Syntax, UnmarshalOptions,
};

fn tag(number: u32, wire_type: u32) -> Vec<u8> {
    varint((number << 3 | wire_type) as u64)
}

fn varint(mut v: u64) -> Vec<u8> {
    let mut out = Vec::new();
    while v >= 0x80 {
        out.push(v as u8 | 0x80);
        v >>= 7;
    }
    out.push(v as u8);
    out
}

fn len_prefixed(number: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = tag(number, 2);
    out.extend(varint(payload.len() as u64));
    out.extend_from_slice(payload);
    out
}

fn compile_one(pool: &DescriptorPool, name: &str) -> rapidpb::Type {
    compile(pool, name, &CompileOptions::new()).unwrap()
}

fn scalar_pool() -> DescriptorPool {
    let mut pool = DescriptorPool::new();
    pool.add_message(
        MessageDescriptor::new("test.S", Syntax::Proto3).with_fields(vec![
            FieldDescriptor::scalar("a", 1, Kind::Int32),
            FieldDescriptor::scalar("b", 2, Kind::String),
            FieldDescriptor::scalar("c", 3, Kind::Bool),
        ]),
    )
    .unwrap();
    pool
}

#[test]
fn scenario_a_scalar_roundtrip() {
    let pool = scalar_pool();
    let ty = compile_one(&pool, "test.S");
    let shared = Shared::new();
    let msg = shared.new_message(&ty);
    msg.unmarshal(&[0x08, 0x2A, 0x12, 0x05, b'h', b'e', b'l', b'l', b'o', 0x18, 0x01])
        .unwrap();

    let desc = ty.descriptor();
    let a = desc.field_by_name("a").unwrap();
    let b = desc.field_by_name("b").unwrap();
    let c = desc.field_by_name("c").unwrap();
    assert_eq!(msg.get(a).unwrap().as_i32(), Some(42));
    assert_eq!(msg.get(b).unwrap().as_str(), Some("hello"));
    assert_eq!(msg.get(c).unwrap().as_bool(), Some(true));
    assert!(msg.has(a) && msg.has(b) && msg.has(c));
}

#[test]
fn scenario_b_packed_fixed_zero_copy() {
    let mut pool = DescriptorPool::new();
    pool.add_message(
        MessageDescriptor::new("test.R", Syntax::Proto3).with_fields(vec![
            FieldDescriptor::repeated("xs", 1, Kind::Fixed32),
        ]),
    )
    .unwrap();
    let ty = compile_one(&pool, "test.R");
    let shared = Shared::new();
    let msg = shared.new_message(&ty);

    let input = [0x0A, 0x08, 0x01, 0, 0, 0, 0x02, 0, 0, 0];
    let before = shared.bytes_allocated();
    msg.unmarshal_with(&input, &UnmarshalOptions::new().allow_alias(true))
        .unwrap();
    // fixed-width packed data aliases the input; nothing hits the arena
    assert_eq!(shared.bytes_allocated(), before);

    let xs = ty.descriptor().field_by_name("xs").unwrap();
    let list = msg.get(xs).unwrap().as_list().unwrap();
    assert_eq!(list.len(), 2);
    assert_eq!(list.get(0).as_u32(), Some(1));
    assert_eq!(list.get(1).as_u32(), Some(2));
}

#[test]
fn scenario_c_string_map() {
    let mut pool = DescriptorPool::new();
    pool.add_message(
        MessageDescriptor::new("test.M", Syntax::Proto3).with_fields(vec![
            FieldDescriptor::map("m", 1, Kind::String, Kind::Int32),
        ]),
    )
    .unwrap();
    let ty = compile_one(&pool, "test.M");
    let shared = Shared::new();
    let msg = shared.new_message(&ty);

    let mut entry1 = len_prefixed(1, b"k1");
    entry1.extend(tag(2, 0));
    entry1.extend(varint(7));
    let mut entry2 = len_prefixed(1, b"k2");
    entry2.extend(tag(2, 0));
    entry2.extend(varint(8));
    let mut input = len_prefixed(1, &entry1);
    input.extend(len_prefixed(1, &entry2));
    msg.unmarshal(&input).unwrap();

    let m = ty.descriptor().field_by_name("m").unwrap();
    let map = msg.get(m).unwrap().as_map().unwrap();
    assert_eq!(map.len(), 2);
    assert_eq!(map.get(MapKey::Str("k1")).unwrap().as_i32(), Some(7));
    assert_eq!(map.get(MapKey::Str("k2")).unwrap().as_i32(), Some(8));
    assert!(map.get(MapKey::Str("missing")).is_none());
}

fn nested_pool() -> DescriptorPool {
    let mut pool = DescriptorPool::new();
    pool.add_message(
        MessageDescriptor::new("test.I", Syntax::Proto3).with_fields(vec![
            FieldDescriptor::scalar("x", 1, Kind::Int32),
        ]),
    )
    .unwrap();
    pool.add_message(
        MessageDescriptor::new("test.N", Syntax::Proto3).with_fields(vec![
            FieldDescriptor::message("i", 1, "test.I"),
            FieldDescriptor::scalar("known", 2, Kind::Int32),
        ]),
    )
    .unwrap();
    pool
}

#[test]
fn scenario_d_nested_and_unknown() {
    let pool = nested_pool();
    let ty = compile_one(&pool, "test.N");
    let shared = Shared::new();
    let msg = shared.new_message(&ty);

    let mut input = len_prefixed(1, &[0x08, 0x05]); // i { x: 5 }
    let unknown_field: Vec<u8> = [tag(99, 0), varint(123)].concat();
    input.extend_from_slice(&unknown_field);
    input.extend(tag(2, 0));
    input.extend(varint(9));
    msg.unmarshal(&input).unwrap();

    let desc = ty.descriptor();
    let i = msg.get(desc.field_by_name("i").unwrap()).unwrap();
    let inner = i.as_message().unwrap();
    let x = inner.descriptor().field_by_name("x").unwrap();
    assert_eq!(inner.get(x).unwrap().as_i32(), Some(5));
    assert_eq!(
        msg.get(desc.field_by_name("known").unwrap())
            .unwrap()
            .as_i32(),
        Some(9)
    );
    assert_eq!(&*msg.unknown(), unknown_field.as_slice());
}

#[test]
fn scenario_d_discard_unknown() {
    let pool = nested_pool();
    let ty = compile_one(&pool, "test.N");
    let shared = Shared::new();
    let msg = shared.new_message(&ty);

    let mut input = tag(99, 0);
    input.extend(varint(123));
    msg.unmarshal_with(&input, &UnmarshalOptions::new().discard_unknown(true))
        .unwrap();
    assert!(msg.unknown().is_empty());
}

#[test]
fn scenario_e_oneof_last_wins() {
    let mut pool = DescriptorPool::new();
    pool.add_message(
        MessageDescriptor::new("test.O", Syntax::Proto3)
            .with_oneofs(&["k"])
            .with_fields(vec![
                FieldDescriptor::scalar("a", 1, Kind::Int32).with_oneof(0),
                FieldDescriptor::scalar("b", 2, Kind::String).with_oneof(0),
            ]),
    )
    .unwrap();
    let ty = compile_one(&pool, "test.O");
    let shared = Shared::new();
    let msg = shared.new_message(&ty);

    let mut input = tag(1, 0);
    input.extend(varint(5));
    input.extend(len_prefixed(2, b"xyz"));
    msg.unmarshal(&input).unwrap();

    let desc = ty.descriptor();
    let a = desc.field_by_name("a").unwrap();
    let b = desc.field_by_name("b").unwrap();
    let k = desc.oneof_by_name("k").unwrap();
    assert_eq!(msg.which_oneof(k).map(|f| f.name.as_str()), Some("b"));
    assert!(!msg.has(a));
    assert_eq!(msg.get(b).unwrap().as_str(), Some("xyz"));
}

#[test]
fn scenario_f_truncated_offset() {
    let pool = scalar_pool();
    let ty = compile_one(&pool, "test.S");
    let shared = Shared::new();
    let msg = shared.new_message(&ty);

    let err = msg.unmarshal(&[0x08]).unwrap_err();
    assert_eq!(err.code(), ErrorCode::Truncated);
    assert_eq!(err.offset(), 1);
}

// ---------------------------------------------------------------------------
// Round-trip / idempotence laws
// ---------------------------------------------------------------------------

#[test]
fn empty_payload_yields_defaults() {
    let pool = scalar_pool();
    let ty = compile_one(&pool, "test.S");
    let shared = Shared::new();
    let msg = shared.new_message(&ty);
    msg.unmarshal(&[]).unwrap();

    let desc = ty.descriptor();
    for field in &desc.fields {
        assert!(!msg.has(field), "{} unexpectedly present", field.name);
    }
    let a = desc.field_by_name("a").unwrap();
    let b = desc.field_by_name("b").unwrap();
    assert_eq!(msg.get_or_default(a).unwrap().as_i32(), Some(0));
    assert_eq!(msg.get_or_default(b).unwrap().as_str(), Some(""));
}

#[test]
fn concatenated_payload_merges_last_wins() {
    let pool = scalar_pool();
    let ty = compile_one(&pool, "test.S");
    let shared = Shared::new();
    let msg = shared.new_message(&ty);

    let mut p1 = tag(1, 0);
    p1.extend(varint(1));
    p1.extend(len_prefixed(2, b"first"));
    let mut p2 = tag(1, 0);
    p2.extend(varint(2));

    let combined: Vec<u8> = [p1, p2].concat();
    msg.unmarshal(&combined).unwrap();

    let desc = ty.descriptor();
    assert_eq!(
        msg.get(desc.field_by_name("a").unwrap()).unwrap().as_i32(),
        Some(2)
    );
    assert_eq!(
        msg.get(desc.field_by_name("b").unwrap()).unwrap().as_str(),
        Some("first")
    );
}

#[test]
fn free_and_reuse() {
    let pool = scalar_pool();
    let ty = compile_one(&pool, "test.S");
    let mut shared = Shared::new();
    {
        let msg = shared.new_message(&ty);
        msg.unmarshal(&[0x08, 0x07]).unwrap();
        let a = ty.descriptor().field_by_name("a").unwrap();
        assert_eq!(msg.get(a).unwrap().as_i32(), Some(7));
    }
    shared.free();
    {
        let msg = shared.new_message(&ty);
        msg.unmarshal(&[0x08, 0x09]).unwrap();
        let a = ty.descriptor().field_by_name("a").unwrap();
        assert_eq!(msg.get(a).unwrap().as_i32(), Some(9));
    }
    shared.free();
    shared.free(); // idempotent
}

// ---------------------------------------------------------------------------
// Boundary behaviors
// ---------------------------------------------------------------------------

fn u64_pool() -> DescriptorPool {
    let mut pool = DescriptorPool::new();
    pool.add_message(
        MessageDescriptor::new("test.U", Syntax::Proto3).with_fields(vec![
            FieldDescriptor::scalar("v", 1, Kind::Uint64),
        ]),
    )
    .unwrap();
    pool
}

#[test]
fn ten_byte_varint_max() {
    let pool = u64_pool();
    let ty = compile_one(&pool, "test.U");
    let shared = Shared::new();
    let msg = shared.new_message(&ty);

    let mut input = tag(1, 0);
    input.extend([0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x01]);
    msg.unmarshal(&input).unwrap();
    let v = ty.descriptor().field_by_name("v").unwrap();
    assert_eq!(msg.get(v).unwrap().as_u64(), Some(u64::MAX));
}

#[test]
fn eleven_byte_varint_overflows() {
    let pool = u64_pool();
    let ty = compile_one(&pool, "test.U");
    let shared = Shared::new();
    let msg = shared.new_message(&ty);

    let mut input = tag(1, 0);
    input.extend([0xFF; 10]);
    input.push(0x01);
    let err = msg.unmarshal(&input).unwrap_err();
    assert_eq!(err.code(), ErrorCode::Overflow);
}

#[test]
fn packed_fixed32_bad_length_truncated() {
    let mut pool = DescriptorPool::new();
    pool.add_message(
        MessageDescriptor::new("test.R", Syntax::Proto3).with_fields(vec![
            FieldDescriptor::repeated("xs", 1, Kind::Fixed32),
        ]),
    )
    .unwrap();
    let ty = compile_one(&pool, "test.R");
    let shared = Shared::new();
    let msg = shared.new_message(&ty);

    let err = msg
        .unmarshal(&[0x0A, 0x06, 1, 0, 0, 0, 2, 0])
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Truncated);
}

fn recursive_pool() -> DescriptorPool {
    let mut pool = DescriptorPool::new();
    pool.add_message(
        MessageDescriptor::new("test.Rec", Syntax::Proto3).with_fields(vec![
            FieldDescriptor::message("inner", 1, "test.Rec"),
        ]),
    )
    .unwrap();
    pool
}

fn nested_input(depth: usize) -> Vec<u8> {
    let mut payload = Vec::new();
    for _ in 0..depth {
        payload = len_prefixed(1, &payload);
    }
    payload
}

#[test]
fn recursion_depth_boundary() {
    let pool = recursive_pool();
    let ty = compile_one(&pool, "test.Rec");
    let opts = UnmarshalOptions::new().max_depth(5);

    let shared = Shared::new();
    let msg = shared.new_message(&ty);
    msg.unmarshal_with(&nested_input(5), &opts).unwrap();

    let shared2 = Shared::new();
    let msg2 = shared2.new_message(&ty);
    let err = msg2.unmarshal_with(&nested_input(6), &opts).unwrap_err();
    assert_eq!(err.code(), ErrorCode::RecursionDepth);
}

fn string_pool() -> DescriptorPool {
    let mut pool = DescriptorPool::new();
    pool.add_message(
        MessageDescriptor::new("test.Str", Syntax::Proto3).with_fields(vec![
            FieldDescriptor::scalar("s", 1, Kind::String),
        ]),
    )
    .unwrap();
    pool
}

#[test]
fn invalid_utf8_rejected() {
    let pool = string_pool();
    let ty = compile_one(&pool, "test.Str");
    let shared = Shared::new();
    let msg = shared.new_message(&ty);

    // lone surrogate U+D800
    let input = len_prefixed(1, &[0xED, 0xA0, 0x80]);
    let err = msg.unmarshal(&input).unwrap_err();
    assert_eq!(err.code(), ErrorCode::Utf8);
}

#[test]
fn invalid_utf8_allowed_surfaces_bytes() {
    let pool = string_pool();
    let ty = compile_one(&pool, "test.Str");
    let shared = Shared::new();
    let msg = shared.new_message(&ty);

    let input = len_prefixed(1, &[0xFF, 0xFE]);
    msg.unmarshal_with(&input, &UnmarshalOptions::new().allow_invalid_utf8(true))
        .unwrap();
    let s = ty.descriptor().field_by_name("s").unwrap();
    assert_eq!(msg.get(s).unwrap().as_bytes(), Some(&[0xFF, 0xFE][..]));
}

#[test]
fn proto2_string_skips_utf8_validation() {
    let mut pool = DescriptorPool::new();
    pool.add_message(
        MessageDescriptor::new("test.P2", Syntax::Proto2).with_fields(vec![
            FieldDescriptor::optional("s", 1, Kind::String),
        ]),
    )
    .unwrap();
    let ty = compile_one(&pool, "test.P2");
    let shared = Shared::new();
    let msg = shared.new_message(&ty);

    let input = len_prefixed(1, &[0xFF, 0xFE]);
    msg.unmarshal(&input).unwrap();
    assert!(msg.has(ty.descriptor().field_by_name("s").unwrap()));
}

#[test]
fn negative_zero_float_is_present() {
    let mut pool = DescriptorPool::new();
    pool.add_message(
        MessageDescriptor::new("test.F", Syntax::Proto3).with_fields(vec![
            FieldDescriptor::scalar("f", 1, Kind::Float),
        ]),
    )
    .unwrap();
    let ty = compile_one(&pool, "test.F");
    let f = ty.descriptor().field_by_name("f").unwrap();

    let shared = Shared::new();
    let msg = shared.new_message(&ty);
    msg.unmarshal(&[0x0D, 0x00, 0x00, 0x00, 0x80]).unwrap();
    assert!(msg.has(f));
    assert_eq!(msg.get(f).unwrap().as_f32(), Some(-0.0));

    let shared2 = Shared::new();
    let msg2 = shared2.new_message(&ty);
    msg2.unmarshal(&[0x0D, 0x00, 0x00, 0x00, 0x00]).unwrap();
    assert!(!msg2.has(f));
}

// ---------------------------------------------------------------------------
// Repeated and packed forms
// ---------------------------------------------------------------------------

#[test]
fn packed_varints_zero_copy_then_append() {
    let mut pool = DescriptorPool::new();
    pool.add_message(
        MessageDescriptor::new("test.R", Syntax::Proto3).with_fields(vec![
            FieldDescriptor::repeated("xs", 1, Kind::Int32),
        ]),
    )
    .unwrap();
    let ty = compile_one(&pool, "test.R");
    let xs = ty.descriptor().field_by_name("xs").unwrap();

    let shared = Shared::new();
    let msg = shared.new_message(&ty);
    // packed run of one-byte varints, then an unpacked element
    let mut input = len_prefixed(1, &[1, 2, 3]);
    input.extend(tag(1, 0));
    input.extend(varint(300));
    msg.unmarshal(&input).unwrap();

    let list = msg.get(xs).unwrap().as_list().unwrap();
    let got: Vec<i32> = list.iter().map(|v| v.as_i32().unwrap()).collect();
    assert_eq!(got, vec![1, 2, 3, 300]);
}

#[test]
fn packed_multibyte_varints() {
    let mut pool = DescriptorPool::new();
    pool.add_message(
        MessageDescriptor::new("test.R", Syntax::Proto3).with_fields(vec![
            FieldDescriptor::repeated("xs", 1, Kind::Int32),
        ]),
    )
    .unwrap();
    let ty = compile_one(&pool, "test.R");
    let xs = ty.descriptor().field_by_name("xs").unwrap();

    let shared = Shared::new();
    let msg = shared.new_message(&ty);
    let payload: Vec<u8> = [varint(1), varint(300), varint(70000)].concat();
    msg.unmarshal(&len_prefixed(1, &payload)).unwrap();

    let list = msg.get(xs).unwrap().as_list().unwrap();
    let got: Vec<i32> = list.iter().map(|v| v.as_i32().unwrap()).collect();
    assert_eq!(got, vec![1, 300, 70000]);
}

#[test]
fn packed_sint64_zigzag() {
    let mut pool = DescriptorPool::new();
    pool.add_message(
        MessageDescriptor::new("test.R", Syntax::Proto3).with_fields(vec![
            FieldDescriptor::repeated("xs", 1, Kind::Sint64),
        ]),
    )
    .unwrap();
    let ty = compile_one(&pool, "test.R");
    let xs = ty.descriptor().field_by_name("xs").unwrap();

    let shared = Shared::new();
    let msg = shared.new_message(&ty);
    // zigzag: 0 -> 0, 1 -> -1, 2 -> 1, 3 -> -2
    msg.unmarshal(&len_prefixed(1, &[0, 1, 2, 3])).unwrap();

    let list = msg.get(xs).unwrap().as_list().unwrap();
    let got: Vec<i64> = list.iter().map(|v| v.as_i64().unwrap()).collect();
    assert_eq!(got, vec![0, -1, 1, -2]);
}

#[test]
fn repeated_strings() {
    let mut pool = DescriptorPool::new();
    pool.add_message(
        MessageDescriptor::new("test.R", Syntax::Proto3).with_fields(vec![
            FieldDescriptor::repeated("ss", 1, Kind::String),
        ]),
    )
    .unwrap();
    let ty = compile_one(&pool, "test.R");
    let ss = ty.descriptor().field_by_name("ss").unwrap();

    let shared = Shared::new();
    let msg = shared.new_message(&ty);
    let mut input = len_prefixed(1, b"alpha");
    input.extend(len_prefixed(1, b"beta"));
    input.extend(len_prefixed(1, b""));
    msg.unmarshal(&input).unwrap();

    let list = msg.get(ss).unwrap().as_list().unwrap();
    assert_eq!(list.len(), 3);
    assert_eq!(list.get(0).as_str(), Some("alpha"));
    assert_eq!(list.get(1).as_str(), Some("beta"));
    assert_eq!(list.get(2).as_str(), Some(""));
}

#[test]
fn repeated_messages_inline_then_spill() {
    let mut pool = nested_pool();
    pool.add_message(
        MessageDescriptor::new("test.RM", Syntax::Proto3).with_fields(vec![
            FieldDescriptor::repeated_message("items", 1, "test.I"),
        ]),
    )
    .unwrap();
    let ty = compile_one(&pool, "test.RM");
    let items = ty.descriptor().field_by_name("items").unwrap();

    let shared = Shared::new();
    let msg = shared.new_message(&ty);
    let mut input = Vec::new();
    for i in 1..=5u64 {
        let mut item = tag(1, 0);
        item.extend(varint(i));
        input.extend(len_prefixed(1, &item));
    }
    msg.unmarshal(&input).unwrap();

    let list = msg.get(items).unwrap().as_list().unwrap();
    assert_eq!(list.len(), 5);
    for i in 0..5 {
        let item = list.get(i).as_message().unwrap();
        let x = item.descriptor().field_by_name("x").unwrap();
        assert_eq!(item.get(x).unwrap().as_i32(), Some(i as i32 + 1));
    }
}

#[test]
fn split_message_segments_merge() {
    let pool = nested_pool();
    let ty = compile_one(&pool, "test.N");
    let shared = Shared::new();
    let msg = shared.new_message(&ty);

    // the same singular message field twice; segments merge per proto
    let mut input = len_prefixed(1, &[0x08, 0x05]);
    input.extend(len_prefixed(1, &[]));
    msg.unmarshal(&input).unwrap();

    let i = msg
        .get(ty.descriptor().field_by_name("i").unwrap())
        .unwrap()
        .as_message()
        .unwrap();
    let x = i.descriptor().field_by_name("x").unwrap();
    assert_eq!(i.get(x).unwrap().as_i32(), Some(5));
}

// ---------------------------------------------------------------------------
// Maps
// ---------------------------------------------------------------------------

#[test]
fn int_map_last_wins() {
    let mut pool = DescriptorPool::new();
    pool.add_message(
        MessageDescriptor::new("test.M", Syntax::Proto3).with_fields(vec![
            FieldDescriptor::map("m", 1, Kind::Int32, Kind::Int64),
        ]),
    )
    .unwrap();
    let ty = compile_one(&pool, "test.M");
    let m = ty.descriptor().field_by_name("m").unwrap();

    let shared = Shared::new();
    let msg = shared.new_message(&ty);
    let entry = |k: u64, v: u64| -> Vec<u8> {
        let mut e = tag(1, 0);
        e.extend(varint(k));
        e.extend(tag(2, 0));
        e.extend(varint(v));
        e
    };
    let mut input = len_prefixed(1, &entry(5, 10));
    input.extend(len_prefixed(1, &entry(5, 20)));
    msg.unmarshal(&input).unwrap();

    let map = msg.get(m).unwrap().as_map().unwrap();
    assert_eq!(map.len(), 1);
    assert_eq!(map.get(MapKey::I32(5)).unwrap().as_i64(), Some(20));
}

#[test]
fn map_with_message_values() {
    let mut pool = nested_pool();
    pool.add_message(
        MessageDescriptor::new("test.MM", Syntax::Proto3).with_fields(vec![
            FieldDescriptor::map_message("m", 1, Kind::String, "test.I"),
        ]),
    )
    .unwrap();
    let ty = compile_one(&pool, "test.MM");
    let m = ty.descriptor().field_by_name("m").unwrap();

    let shared = Shared::new();
    let msg = shared.new_message(&ty);
    let mut entry = len_prefixed(1, b"key");
    entry.extend(len_prefixed(2, &[0x08, 0x2A])); // I { x: 42 }
    msg.unmarshal(&len_prefixed(1, &entry)).unwrap();

    let map = msg.get(m).unwrap().as_map().unwrap();
    let inner = map.get(MapKey::Str("key")).unwrap().as_message().unwrap();
    let x = inner.descriptor().field_by_name("x").unwrap();
    assert_eq!(inner.get(x).unwrap().as_i32(), Some(42));
}

#[test]
fn map_entry_reversed_order() {
    let mut pool = DescriptorPool::new();
    pool.add_message(
        MessageDescriptor::new("test.M", Syntax::Proto3).with_fields(vec![
            FieldDescriptor::map("m", 1, Kind::Uint32, Kind::Uint32),
        ]),
    )
    .unwrap();
    let ty = compile_one(&pool, "test.M");
    let m = ty.descriptor().field_by_name("m").unwrap();

    let shared = Shared::new();
    let msg = shared.new_message(&ty);
    // value before key: still a valid entry
    let mut entry = tag(2, 0);
    entry.extend(varint(9));
    entry.extend(tag(1, 0));
    entry.extend(varint(4));
    msg.unmarshal(&len_prefixed(1, &entry)).unwrap();

    let map = msg.get(m).unwrap().as_map().unwrap();
    assert_eq!(map.get(MapKey::U32(4)).unwrap().as_u32(), Some(9));
}

#[test]
fn bool_map_keys() {
    let mut pool = DescriptorPool::new();
    pool.add_message(
        MessageDescriptor::new("test.M", Syntax::Proto3).with_fields(vec![
            FieldDescriptor::map("m", 1, Kind::Bool, Kind::String),
        ]),
    )
    .unwrap();
    let ty = compile_one(&pool, "test.M");
    let m = ty.descriptor().field_by_name("m").unwrap();

    let shared = Shared::new();
    let msg = shared.new_message(&ty);
    let mut entry = tag(1, 0);
    entry.extend(varint(1));
    entry.extend(len_prefixed(2, b"yes"));
    msg.unmarshal(&len_prefixed(1, &entry)).unwrap();

    let map = msg.get(m).unwrap().as_map().unwrap();
    assert_eq!(map.get(MapKey::Bool(true)).unwrap().as_str(), Some("yes"));
    assert!(map.get(MapKey::Bool(false)).is_none());
}

// ---------------------------------------------------------------------------
// Oneofs
// ---------------------------------------------------------------------------

#[test]
fn oneof_message_variant_switch_clears_stale_slot() {
    let mut pool = nested_pool();
    pool.add_message(
        MessageDescriptor::new("test.O2", Syntax::Proto3)
            .with_oneofs(&["k"])
            .with_fields(vec![
                FieldDescriptor::message("m", 1, "test.I").with_oneof(0),
                FieldDescriptor::scalar("s", 2, Kind::String).with_oneof(0),
            ]),
    )
    .unwrap();
    let ty = compile_one(&pool, "test.O2");
    let desc = ty.descriptor();

    let shared = Shared::new();
    let msg = shared.new_message(&ty);
    let mut input = len_prefixed(1, &[0x08, 0x05]); // m { x: 5 }
    input.extend(len_prefixed(2, b"abc")); // s
    input.extend(len_prefixed(1, &[0x08, 0x07])); // m { x: 7 } again
    msg.unmarshal(&input).unwrap();

    let k = desc.oneof_by_name("k").unwrap();
    assert_eq!(msg.which_oneof(k).map(|f| f.name.as_str()), Some("m"));
    assert!(!msg.has(desc.field_by_name("s").unwrap()));
    let inner = msg
        .get(desc.field_by_name("m").unwrap())
        .unwrap()
        .as_message()
        .unwrap();
    let x = inner.descriptor().field_by_name("x").unwrap();
    assert_eq!(inner.get(x).unwrap().as_i32(), Some(7));
}

#[test]
fn which_oneof_none_when_unset() {
    let mut pool = DescriptorPool::new();
    pool.add_message(
        MessageDescriptor::new("test.O", Syntax::Proto3)
            .with_oneofs(&["k"])
            .with_fields(vec![
                FieldDescriptor::scalar("a", 1, Kind::Int32).with_oneof(0),
                FieldDescriptor::scalar("b", 2, Kind::Int64).with_oneof(0),
            ]),
    )
    .unwrap();
    let ty = compile_one(&pool, "test.O");
    let shared = Shared::new();
    let msg = shared.new_message(&ty);
    msg.unmarshal(&[]).unwrap();
    let k = ty.descriptor().oneof_by_name("k").unwrap();
    assert!(msg.which_oneof(k).is_none());
}

#[test]
fn single_variant_oneof_degrades_to_optional() {
    let mut pool = DescriptorPool::new();
    pool.add_message(
        MessageDescriptor::new("test.O1", Syntax::Proto3)
            .with_oneofs(&["k"])
            .with_fields(vec![
                FieldDescriptor::scalar("only", 1, Kind::Int32).with_oneof(0),
            ]),
    )
    .unwrap();
    let ty = compile_one(&pool, "test.O1");
    let desc = ty.descriptor();
    let only = desc.field_by_name("only").unwrap();
    let k = desc.oneof_by_name("k").unwrap();

    let shared = Shared::new();
    let msg = shared.new_message(&ty);
    msg.unmarshal(&[0x08, 0x00]).unwrap(); // explicit zero
    assert!(msg.has(only));
    assert_eq!(msg.which_oneof(k).map(|f| f.name.as_str()), Some("only"));
}

// ---------------------------------------------------------------------------
// Misc semantics
// ---------------------------------------------------------------------------

#[test]
fn unknown_wire_type_reserved() {
    let pool = scalar_pool();
    let ty = compile_one(&pool, "test.S");
    let shared = Shared::new();
    let msg = shared.new_message(&ty);
    // wire type 7
    let err = msg.unmarshal(&[0x0F]).unwrap_err();
    assert_eq!(err.code(), ErrorCode::Reserved);
}

#[test]
fn field_number_zero_rejected() {
    let pool = scalar_pool();
    let ty = compile_one(&pool, "test.S");
    let shared = Shared::new();
    let msg = shared.new_message(&ty);
    let err = msg.unmarshal(&[0x00]).unwrap_err();
    assert_eq!(err.code(), ErrorCode::FieldNumber);
}

#[test]
fn unmatched_end_group() {
    let pool = scalar_pool();
    let ty = compile_one(&pool, "test.S");
    let shared = Shared::new();
    let msg = shared.new_message(&ty);
    // field 4, wire type 4 (end group) with no open group
    let err = msg.unmarshal(&[0x24]).unwrap_err();
    assert_eq!(err.code(), ErrorCode::EndGroup);
}

#[test]
fn group_skipped_as_unknown() {
    let pool = scalar_pool();
    let ty = compile_one(&pool, "test.S");
    let shared = Shared::new();
    let msg = shared.new_message(&ty);

    // group 9: start, varint field inside, end; then a known field
    let mut input = tag(9, 3);
    input.extend(tag(1, 0));
    input.extend(varint(5));
    input.extend(tag(9, 4));
    let group_len = input.len();
    input.extend(tag(1, 0));
    input.extend(varint(33));
    msg.unmarshal(&input).unwrap();

    let a = ty.descriptor().field_by_name("a").unwrap();
    assert_eq!(msg.get(a).unwrap().as_i32(), Some(33));
    assert_eq!(msg.unknown().len(), group_len);
}

#[test]
fn wrong_wire_type_becomes_unknown() {
    let pool = scalar_pool();
    let ty = compile_one(&pool, "test.S");
    let shared = Shared::new();
    let msg = shared.new_message(&ty);

    // field 1 as fixed64 instead of varint
    let mut input = tag(1, 1);
    input.extend([0u8; 8]);
    msg.unmarshal(&input).unwrap();
    let a = ty.descriptor().field_by_name("a").unwrap();
    assert!(!msg.has(a));
    assert_eq!(msg.unknown().len(), input.len());
}

#[test]
fn exhausted_probe_chain_uses_table_fallback() {
    let mut pool = DescriptorPool::new();
    pool.add_message(
        MessageDescriptor::new("test.W", Syntax::Proto3).with_fields(vec![
            FieldDescriptor::scalar("f1", 1, Kind::Int32),
            FieldDescriptor::scalar("f2", 2, Kind::Int32),
            FieldDescriptor::scalar("f3", 3, Kind::Int32),
            FieldDescriptor::scalar("f4", 4, Kind::Int32),
            FieldDescriptor::scalar("f5", 5, Kind::Int32),
        ]),
    )
    .unwrap();
    let ty = compile_one(&pool, "test.W");
    let shared = Shared::new();
    let msg = shared.new_message(&ty);

    // fields in reverse order defeat the predicted-next chain
    let mut input = Vec::new();
    for number in (1..=5u32).rev() {
        input.extend(tag(number, 0));
        input.extend(varint(number as u64 * 10));
    }
    msg.unmarshal_with(&input, &UnmarshalOptions::new().max_decode_misses(1))
        .unwrap();

    let desc = ty.descriptor();
    for number in 1..=5u32 {
        let field = desc.field_by_number(number).unwrap();
        assert_eq!(
            msg.get(field).unwrap().as_i32(),
            Some(number as i32 * 10),
            "field {number}"
        );
    }
}

#[test]
fn range_visits_in_descriptor_order() {
    let pool = scalar_pool();
    let ty = compile_one(&pool, "test.S");
    let shared = Shared::new();
    let msg = shared.new_message(&ty);
    msg.unmarshal(&[0x18, 0x01, 0x08, 0x2A]).unwrap(); // c then a on the wire

    let mut seen = Vec::new();
    msg.range(|field, _| {
        seen.push(field.name.clone());
        true
    });
    assert_eq!(seen, vec!["a", "c"]);
}

#[test]
fn clear_semantics() {
    let pool = scalar_pool();
    let ty = compile_one(&pool, "test.S");
    let shared = Shared::new();
    let msg = shared.new_message(&ty);
    assert!(msg.clear().is_ok()); // never parsed: no-op
    msg.unmarshal(&[0x08, 0x01]).unwrap();
    assert!(msg.clear().is_err()); // parsed messages are read-only
}

#[test]
#[should_panic(expected = "parse-once")]
fn double_unmarshal_panics() {
    let pool = scalar_pool();
    let ty = compile_one(&pool, "test.S");
    let shared = Shared::new();
    let msg = shared.new_message(&ty);
    msg.unmarshal(&[]).unwrap();
    let _ = msg.unmarshal(&[]);
}

#[test]
fn required_fields_checked_transitively() {
    let mut pool = DescriptorPool::new();
    pool.add_message(
        MessageDescriptor::new("test.Leaf", Syntax::Proto2).with_fields(vec![
            FieldDescriptor::optional("id", 1, Kind::Int32).with_required(),
        ]),
    )
    .unwrap();
    pool.add_message(
        MessageDescriptor::new("test.Root", Syntax::Proto2).with_fields(vec![
            FieldDescriptor::message("leaf", 1, "test.Leaf"),
            FieldDescriptor::optional("tag", 2, Kind::Int32).with_required(),
        ]),
    )
    .unwrap();
    let ty = compile_one(&pool, "test.Root");

    let shared = Shared::new();
    let msg = shared.new_message(&ty);
    let mut input = tag(2, 0);
    input.extend(varint(1));
    input.extend(len_prefixed(1, &[])); // leaf present but id unset
    msg.unmarshal(&input).unwrap();

    let err = msg.check_initialized().unwrap_err();
    assert_eq!(err.field, "leaf.id");

    let shared2 = Shared::new();
    let msg2 = shared2.new_message(&ty);
    let mut input2 = tag(2, 0);
    input2.extend(varint(1));
    input2.extend(len_prefixed(1, &[0x08, 0x09]));
    msg2.unmarshal(&input2).unwrap();
    assert!(msg2.check_initialized().is_ok());
}

#[test]
fn debug_renders_populated_fields() {
    let pool = scalar_pool();
    let ty = compile_one(&pool, "test.S");
    let shared = Shared::new();
    let msg = shared.new_message(&ty);
    msg.unmarshal(&[0x08, 0x2A]).unwrap();
    let rendered = format!("{msg:?}");
    assert!(rendered.contains("test.S"));
    assert!(rendered.contains("42"));
}
