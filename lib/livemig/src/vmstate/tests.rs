// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeMap;

use bitvec::prelude::*;
use lazy_static::lazy_static;
use proptest::prelude::*;

use super::vmdesc::VmsdDesc;
use super::*;
use crate::stream::MemBuffer;

/// Byte which terminates a whole saved stream; appended to every loaded
/// buffer so that the trailing subsection peek has something to look at.
const EOF_MARKER: u8 = 0x00;

fn save_bytes<T>(vmsd: &VMStateDescription<T>, obj: &mut T) -> Vec<u8> {
    let mem = MemBuffer::new();
    let mut f = Stream::output(mem.clone());
    save_state(&mut f, vmsd, obj, None).unwrap();
    f.flush();
    f.error().unwrap();
    mem.contents()
}

fn load_bytes<T>(
    vmsd: &VMStateDescription<T>,
    obj: &mut T,
    wire: &[u8],
    version_id: i32,
) -> VmResult {
    let mut bytes = wire.to_vec();
    bytes.push(EOF_MARKER);
    let mut f = Stream::from_bytes(bytes);
    load_state(&mut f, vmsd, obj, version_id)?;
    assert_eq!(f.get_byte(), EOF_MARKER, "{} left bytes unread", vmsd.name);
    assert!(f.at_eof());
    Ok(())
}

#[derive(Debug, Default, Clone, PartialEq)]
struct TestSimple {
    b_1: bool,
    b_2: bool,
    u8_1: u8,
    u16_1: u16,
    u32_1: u32,
    u64_1: u64,
    i8_1: i8,
    i8_2: i8,
    i16_1: i16,
    i16_2: i16,
    i32_1: i32,
    i32_2: i32,
    i64_1: i64,
    i64_2: i64,
}

type SimpleField = VMStateField<TestSimple>;

fn simple_obj() -> TestSimple {
    TestSimple {
        b_1: true,
        b_2: false,
        u8_1: 130,
        u16_1: 512,
        u32_1: 70000,
        u64_1: 12121212,
        i8_1: 65,
        i8_2: -65,
        i16_1: 512,
        i16_2: -512,
        i32_1: 70000,
        i32_2: -70000,
        i64_1: 12121212,
        i64_2: -12121212,
    }
}

lazy_static! {
    static ref VMSTATE_SIMPLE_PRIMITIVE: VMStateDescription<TestSimple> =
        VMStateDescription::new("simple/primitive", 1, 1).fields(vec![
            SimpleField::single("b_1", &VMSTATE_INFO_BOOL, |s| &mut s.b_1),
            SimpleField::single("b_2", &VMSTATE_INFO_BOOL, |s| &mut s.b_2),
            SimpleField::single("u8_1", &VMSTATE_INFO_UINT8, |s| &mut s.u8_1),
            SimpleField::single("u16_1", &VMSTATE_INFO_UINT16, |s| &mut s.u16_1),
            SimpleField::single("u32_1", &VMSTATE_INFO_UINT32, |s| &mut s.u32_1),
            SimpleField::single("u64_1", &VMSTATE_INFO_UINT64, |s| &mut s.u64_1),
            SimpleField::single("i8_1", &VMSTATE_INFO_INT8, |s| &mut s.i8_1),
            SimpleField::single("i8_2", &VMSTATE_INFO_INT8, |s| &mut s.i8_2),
            SimpleField::single("i16_1", &VMSTATE_INFO_INT16, |s| &mut s.i16_1),
            SimpleField::single("i16_2", &VMSTATE_INFO_INT16, |s| &mut s.i16_2),
            SimpleField::single("i32_1", &VMSTATE_INFO_INT32, |s| &mut s.i32_1),
            SimpleField::single("i32_2", &VMSTATE_INFO_INT32, |s| &mut s.i32_2),
            SimpleField::single("i64_1", &VMSTATE_INFO_INT64, |s| &mut s.i64_1),
            SimpleField::single("i64_2", &VMSTATE_INFO_INT64, |s| &mut s.i64_2),
        ]);

    // The unsigned-then-signed subset, without the negative values.
    static ref VMSTATE_SIMPLE_POSITIVE: VMStateDescription<TestSimple> =
        VMStateDescription::new("simple/positive", 1, 1).fields(vec![
            SimpleField::single("b_1", &VMSTATE_INFO_BOOL, |s| &mut s.b_1),
            SimpleField::single("u8_1", &VMSTATE_INFO_UINT8, |s| &mut s.u8_1),
            SimpleField::single("u16_1", &VMSTATE_INFO_UINT16, |s| &mut s.u16_1),
            SimpleField::single("u32_1", &VMSTATE_INFO_UINT32, |s| &mut s.u32_1),
            SimpleField::single("u64_1", &VMSTATE_INFO_UINT64, |s| &mut s.u64_1),
            SimpleField::single("i8_1", &VMSTATE_INFO_INT8, |s| &mut s.i8_1),
            SimpleField::single("i16_1", &VMSTATE_INFO_INT16, |s| &mut s.i16_1),
            SimpleField::single("i32_1", &VMSTATE_INFO_INT32, |s| &mut s.i32_1),
            SimpleField::single("i64_1", &VMSTATE_INFO_INT64, |s| &mut s.i64_1),
        ]);
}

const WIRE_SIMPLE_PRIMITIVE: &[u8] = &[
    0x01, // b_1
    0x00, // b_2
    0x82, // u8_1
    0x02, 0x00, // u16_1
    0x00, 0x01, 0x11, 0x70, // u32_1
    0x00, 0x00, 0x00, 0x00, 0x00, 0xb8, 0xf4, 0x7c, // u64_1
    0x41, // i8_1
    0xbf, // i8_2
    0x02, 0x00, // i16_1
    0xfe, 0x00, // i16_2
    0x00, 0x01, 0x11, 0x70, // i32_1
    0xff, 0xfe, 0xee, 0x90, // i32_2
    0x00, 0x00, 0x00, 0x00, 0x00, 0xb8, 0xf4, 0x7c, // i64_1
    0xff, 0xff, 0xff, 0xff, 0xff, 0x47, 0x0b, 0x84, // i64_2
];

#[test]
fn simple_primitive_save() {
    let mut obj = simple_obj();
    assert_eq!(
        save_bytes(&VMSTATE_SIMPLE_PRIMITIVE, &mut obj),
        WIRE_SIMPLE_PRIMITIVE
    );
}

#[test]
fn simple_primitive_load() {
    let mut obj = TestSimple::default();
    load_bytes(&VMSTATE_SIMPLE_PRIMITIVE, &mut obj, WIRE_SIMPLE_PRIMITIVE, 1)
        .unwrap();
    assert_eq!(obj, simple_obj());
}

#[test]
fn positive_subset_wire() {
    let mut obj = simple_obj();
    let expected: &[u8] = &[
        0x01, 0x82, 0x02, 0x00, 0x00, 0x01, 0x11, 0x70, 0x00, 0x00, 0x00,
        0x00, 0x00, 0xb8, 0xf4, 0x7c, 0x41, 0x02, 0x00, 0x00, 0x01, 0x11,
        0x70, 0x00, 0x00, 0x00, 0x00, 0x00, 0xb8, 0xf4, 0x7c,
    ];
    assert_eq!(save_bytes(&VMSTATE_SIMPLE_POSITIVE, &mut obj), expected);
}

#[test]
fn truncated_input_fails() {
    for len in [
        0,
        WIRE_SIMPLE_PRIMITIVE.len() / 2,
        WIRE_SIMPLE_PRIMITIVE.len() - 2,
    ] {
        let mut obj = TestSimple::default();
        let mut f = Stream::from_bytes(WIRE_SIMPLE_PRIMITIVE[..len].to_vec());
        assert!(
            load_state(&mut f, &VMSTATE_SIMPLE_PRIMITIVE, &mut obj, 1).is_err(),
            "prefix of {len} bytes loaded"
        );
        assert!(f.error().is_err());
    }

    // Only the second half: misaligned garbage followed by end of input.
    let half = WIRE_SIMPLE_PRIMITIVE.len() / 2;
    let mut obj = TestSimple::default();
    let mut f = Stream::from_bytes(WIRE_SIMPLE_PRIMITIVE[half..].to_vec());
    assert!(load_state(&mut f, &VMSTATE_SIMPLE_PRIMITIVE, &mut obj, 1).is_err());
}

#[test]
fn version_bounds() {
    let mut obj = TestSimple::default();
    let mut f = Stream::from_bytes(WIRE_SIMPLE_PRIMITIVE.to_vec());
    assert!(matches!(
        load_state(&mut f, &VMSTATE_SIMPLE_PRIMITIVE, &mut obj, 2),
        Err(VmStateError::VersionTooNew { version: 2, supported: 1, .. })
    ));
    // Failure is latched on the stream.
    assert!(matches!(f.error(), Err(StreamError::Aborted(_))));

    let mut f = Stream::from_bytes(WIRE_SIMPLE_PRIMITIVE.to_vec());
    assert!(matches!(
        load_state(&mut f, &VMSTATE_SIMPLE_PRIMITIVE, &mut obj, 0),
        Err(VmStateError::VersionTooOld { version: 0, minimum: 1, .. })
    ));
    assert_eq!(obj, TestSimple::default());
}

#[derive(Debug, Default, Clone, PartialEq)]
struct TestArray {
    size: u32,
    u16_1: [u16; 3],
}

type ArrayField = VMStateField<TestArray>;

lazy_static! {
    static ref VMSTATE_ARRAY_PRIMITIVE: VMStateDescription<TestArray> =
        VMStateDescription::new("array/primitive", 1, 1).fields(vec![
            ArrayField::array(
                "u16_1",
                &VMSTATE_INFO_UINT16,
                Count::Fixed(3),
                |s| &mut s.u16_1[..],
            ),
        ]);
    static ref VMSTATE_ARRAY_VARIABLE: VMStateDescription<TestArray> =
        VMStateDescription::new("array/variable", 1, 1).fields(vec![
            ArrayField::single("size", &VMSTATE_INFO_UINT32, |s| &mut s.size),
            ArrayField::array(
                "u16_1",
                &VMSTATE_INFO_UINT16,
                Count::Sibling(|s| s.size as usize),
                |s| &mut s.u16_1[..],
            ),
        ]);
}

#[test]
fn array_primitive() {
    let mut obj = TestArray { size: 0, u16_1: [0x42, 0x43, 0x44] };
    let wire = save_bytes(&VMSTATE_ARRAY_PRIMITIVE, &mut obj);
    assert_eq!(wire, [0x00, 0x42, 0x00, 0x43, 0x00, 0x44]);

    let mut loaded = TestArray::default();
    load_bytes(&VMSTATE_ARRAY_PRIMITIVE, &mut loaded, &wire, 1).unwrap();
    assert_eq!(loaded.u16_1, [0x42, 0x43, 0x44]);
}

#[test]
fn array_count_from_sibling() {
    let mut obj = TestArray { size: 2, u16_1: [1, 2, 3] };
    let wire = save_bytes(&VMSTATE_ARRAY_VARIABLE, &mut obj);
    assert_eq!(wire, [0, 0, 0, 2, 0x00, 0x01, 0x00, 0x02]);

    let mut loaded = TestArray { size: 0, u16_1: [9, 9, 9] };
    load_bytes(&VMSTATE_ARRAY_VARIABLE, &mut loaded, &wire, 1).unwrap();
    assert_eq!(loaded, TestArray { size: 2, u16_1: [1, 2, 9] });

    // A count larger than the backing array is refused rather than
    // overrunning it.
    let mut f = Stream::from_bytes(vec![0, 0, 0, 4, 0, 1, 0, 2, 0, 3, 0, 4]);
    assert!(matches!(
        load_state(&mut f, &VMSTATE_ARRAY_VARIABLE, &mut loaded, 1),
        Err(VmStateError::CountOverflow { count: 4, capacity: 3, .. })
    ));
}

#[derive(Debug, Default, Clone, PartialEq)]
struct TestStruct {
    a: u32,
    b: u32,
    c: u32,
    e: u32,
    d: u64,
    f: u64,
    skip_c_e: bool,
}

type StructField = VMStateField<TestStruct>;

fn skip_c_e(obj: &TestStruct, _version_id: i32) -> bool {
    !obj.skip_c_e
}

lazy_static! {
    static ref VMSTATE_VERSIONED: VMStateDescription<TestStruct> =
        VMStateDescription::new("test/versioned", 2, 1).fields(vec![
            StructField::single("a", &VMSTATE_INFO_UINT32, |s| &mut s.a),
            StructField::single("b", &VMSTATE_INFO_UINT32, |s| &mut s.b).since(2),
            StructField::single("c", &VMSTATE_INFO_UINT32, |s| &mut s.c),
            StructField::single("d", &VMSTATE_INFO_UINT64, |s| &mut s.d),
            StructField::single("e", &VMSTATE_INFO_UINT32, |s| &mut s.e).since(2),
            StructField::single("f", &VMSTATE_INFO_UINT64, |s| &mut s.f).since(2),
        ]);
    static ref VMSTATE_SKIPPING: VMStateDescription<TestStruct> =
        VMStateDescription::new("test/skip", 2, 1).fields(vec![
            StructField::single("a", &VMSTATE_INFO_UINT32, |s| &mut s.a),
            StructField::single("b", &VMSTATE_INFO_UINT32, |s| &mut s.b),
            StructField::single("c", &VMSTATE_INFO_UINT32, |s| &mut s.c)
                .exists_if(skip_c_e),
            StructField::single("d", &VMSTATE_INFO_UINT64, |s| &mut s.d),
            StructField::single("e", &VMSTATE_INFO_UINT32, |s| &mut s.e)
                .exists_if(skip_c_e),
            StructField::single("f", &VMSTATE_INFO_UINT64, |s| &mut s.f),
        ]);
}

#[test]
fn load_older_version_keeps_newer_fields() {
    let mut obj = TestStruct { b: 200, e: 500, f: 600, ..Default::default() };
    let wire = [
        0, 0, 0, 10, // a
        0, 0, 0, 30, // c
        0, 0, 0, 0, 0, 0, 0, 40, // d
    ];
    load_bytes(&VMSTATE_VERSIONED, &mut obj, &wire, 1).unwrap();
    assert_eq!(
        obj,
        TestStruct {
            a: 10,
            b: 200,
            c: 30,
            d: 40,
            e: 500,
            f: 600,
            skip_c_e: false
        }
    );
}

#[test]
fn load_current_version() {
    let mut obj = TestStruct::default();
    let wire = [
        0, 0, 0, 10, // a
        0, 0, 0, 20, // b
        0, 0, 0, 30, // c
        0, 0, 0, 0, 0, 0, 0, 40, // d
        0, 0, 0, 50, // e
        0, 0, 0, 0, 0, 0, 0, 60, // f
    ];
    load_bytes(&VMSTATE_VERSIONED, &mut obj, &wire, 2).unwrap();
    assert_eq!((obj.a, obj.b, obj.c, obj.d, obj.e, obj.f), (10, 20, 30, 40, 50, 60));
}

#[test]
fn field_exists_skips() {
    let mut obj = TestStruct {
        a: 1,
        b: 2,
        c: 3,
        d: 4,
        e: 5,
        f: 6,
        skip_c_e: true,
    };
    let wire = save_bytes(&VMSTATE_SKIPPING, &mut obj);
    assert_eq!(
        wire,
        [
            0, 0, 0, 1, // a
            0, 0, 0, 2, // b
            0, 0, 0, 0, 0, 0, 0, 4, // d
            0, 0, 0, 0, 0, 0, 0, 6, // f
        ]
    );

    let mut loaded = TestStruct { c: 300, e: 500, skip_c_e: true, ..Default::default() };
    load_bytes(&VMSTATE_SKIPPING, &mut loaded, &wire, 2).unwrap();
    assert_eq!((loaded.c, loaded.e), (300, 500));
    assert_eq!((loaded.a, loaded.b, loaded.d, loaded.f), (1, 2, 4, 6));

    obj.skip_c_e = false;
    assert_eq!(save_bytes(&VMSTATE_SKIPPING, &mut obj).len(), 32);
}

// Structures nested by value, through pointers and in arrays.

#[derive(Debug, Default, Clone, PartialEq)]
struct TestStructTriv {
    i: i32,
}

#[derive(Debug, Default, PartialEq)]
struct TestArrayOfPtr {
    ptrs: [Option<Box<TestStructTriv>>; 4],
    ints: [Option<Box<i32>>; 4],
}

type PtrField = VMStateField<TestArrayOfPtr>;

lazy_static! {
    static ref VMSTATE_TRIV: VMStateDescription<TestStructTriv> =
        VMStateDescription::new("struct/triv", 1, 1).fields(vec![
            VMStateField::<TestStructTriv>::single(
                "i",
                &VMSTATE_INFO_INT32,
                |s| &mut s.i,
            ),
        ]);
    static ref VMSTATE_ARRAY_OF_PTR: VMStateDescription<TestArrayOfPtr> =
        VMStateDescription::new("array/ptr", 1, 1).fields(vec![
            PtrField::struct_pointer_array(
                "ptrs",
                &VMSTATE_TRIV,
                Count::Fixed(4),
                |s| &mut s.ptrs[..],
            ),
            PtrField::pointer_array(
                "ints",
                &VMSTATE_INFO_INT32,
                Count::Fixed(4),
                |s| &mut s.ints[..],
            ),
        ]);
}

fn triv(i: i32) -> Option<Box<TestStructTriv>> {
    Some(Box::new(TestStructTriv { i }))
}

#[test]
fn pointer_arrays_with_nulls() {
    let mut obj = TestArrayOfPtr {
        ptrs: [triv(0), triv(1), None, triv(3)],
        ints: [None, Some(Box::new(-1)), None, Some(Box::new(7))],
    };
    let wire = save_bytes(&VMSTATE_ARRAY_OF_PTR, &mut obj);
    assert_eq!(
        wire,
        [
            0, 0, 0, 0, // ptrs[0]
            0, 0, 0, 1, // ptrs[1]
            VMS_NULLPTR_MARKER,
            0, 0, 0, 3, // ptrs[3]
            VMS_NULLPTR_MARKER,
            0xff, 0xff, 0xff, 0xff, // ints[1]
            VMS_NULLPTR_MARKER,
            0, 0, 0, 7, // ints[3]
        ]
    );

    let mut loaded = TestArrayOfPtr {
        ptrs: [triv(9), triv(9), None, triv(9)],
        ints: [None, Some(Box::new(0)), None, Some(Box::new(0))],
    };
    load_bytes(&VMSTATE_ARRAY_OF_PTR, &mut loaded, &wire, 1).unwrap();
    assert_eq!(loaded, obj);
}

#[test]
fn pointer_arrays_every_null_pattern() {
    // Bit n of the mask makes slot n null, covering all-null, all-set,
    // alternating and every single-null layout.
    let slots = |mask: u32, v: i32| -> [Option<Box<TestStructTriv>>; 4] {
        std::array::from_fn(|n| {
            if mask & (1 << n) != 0 {
                None
            } else {
                triv(v + n as i32)
            }
        })
    };
    let ints = |mask: u32, v: i32| -> [Option<Box<i32>>; 4] {
        std::array::from_fn(|n| {
            if mask & (1 << n) != 0 {
                None
            } else {
                Some(Box::new(v - n as i32))
            }
        })
    };

    for mask in 0u32..16 {
        let mut obj =
            TestArrayOfPtr { ptrs: slots(mask, 10), ints: ints(!mask & 0xf, -3) };
        let wire = save_bytes(&VMSTATE_ARRAY_OF_PTR, &mut obj);
        let markers = wire.iter().filter(|b| **b == VMS_NULLPTR_MARKER).count();
        assert_eq!(markers, 4, "mask {mask:#x}");
        assert_eq!(wire.len(), 4 + 4 * 4, "mask {mask:#x}");

        let mut loaded =
            TestArrayOfPtr { ptrs: slots(mask, 0), ints: ints(!mask & 0xf, 0) };
        load_bytes(&VMSTATE_ARRAY_OF_PTR, &mut loaded, &wire, 1).unwrap();
        assert_eq!(loaded, obj, "mask {mask:#x}");
    }
}

#[test]
fn pointer_array_null_mismatch() {
    let mut obj = TestArrayOfPtr {
        ptrs: [triv(0), triv(1), triv(2), triv(3)],
        ints: [None, None, None, None],
    };
    let wire = save_bytes(&VMSTATE_ARRAY_OF_PTR, &mut obj);

    // The destination expects a null in a slot where the source had data.
    let mut loaded = TestArrayOfPtr {
        ptrs: [None, triv(9), triv(9), triv(9)],
        ints: [None, None, None, None],
    };
    let mut f = Stream::from_bytes(wire);
    assert!(matches!(
        load_state(&mut f, &VMSTATE_ARRAY_OF_PTR, &mut loaded, 1),
        Err(VmStateError::NotNullMarker(0))
    ));
}

#[derive(Debug, Default)]
struct TestBoxed {
    triv: Option<Box<TestStructTriv>>,
    hook_ran: bool,
}

lazy_static! {
    static ref VMSTATE_BOXED: VMStateDescription<TestBoxed> =
        VMStateDescription::new("struct/boxed", 1, 1)
            .fields(vec![VMStateField::<TestBoxed>::struct_pointer(
                "triv",
                &VMSTATE_TRIV,
                |s| &mut s.triv,
            )])
            .post_save(|s| {
                s.hook_ran = true;
                Ok(())
            });
}

#[test]
fn boxed_struct_allocated_on_load() {
    let mut obj = TestBoxed { triv: triv(5), hook_ran: false };
    let wire = save_bytes(&VMSTATE_BOXED, &mut obj);
    assert_eq!(wire, [0, 0, 0, 5]);
    assert!(obj.hook_ran);

    let mut loaded = TestBoxed::default();
    load_bytes(&VMSTATE_BOXED, &mut loaded, &wire, 1).unwrap();
    assert_eq!(loaded.triv.map(|t| t.i), Some(5));
}

#[test]
fn post_save_runs_after_failure() {
    let mut obj = TestBoxed::default();
    let mut f = Stream::output(MemBuffer::new());
    assert!(matches!(
        save_state(&mut f, &VMSTATE_BOXED, &mut obj, None),
        Err(VmStateError::NullPointer { field: "triv" })
    ));
    assert!(obj.hook_ran);
}

// Queues

#[derive(Debug, Default, Clone, PartialEq)]
struct TestQtailqElement {
    b: bool,
    u8: u8,
}

#[derive(Debug, Default, Clone, PartialEq)]
struct TestQtailq {
    i16: i16,
    q: Vec<TestQtailqElement>,
    i32: i32,
}

lazy_static! {
    static ref VMSTATE_Q_ELEMENT: VMStateDescription<TestQtailqElement> =
        VMStateDescription::new("test/queue-elem", 1, 1).fields(vec![
            VMStateField::<TestQtailqElement>::single(
                "b",
                &VMSTATE_INFO_BOOL,
                |s| &mut s.b,
            ),
            VMStateField::<TestQtailqElement>::single(
                "u8",
                &VMSTATE_INFO_UINT8,
                |s| &mut s.u8,
            ),
        ]);
    static ref VMSTATE_Q: VMStateDescription<TestQtailq> =
        VMStateDescription::new("test/queue", 1, 1).fields(vec![
            VMStateField::<TestQtailq>::single(
                "i16",
                &VMSTATE_INFO_INT16,
                |s| &mut s.i16,
            ),
            VMStateField::<TestQtailq>::qtailq(
                "q",
                1,
                &VMSTATE_Q_ELEMENT,
                |s| &mut s.q,
            ),
            VMStateField::<TestQtailq>::single(
                "i32",
                &VMSTATE_INFO_INT32,
                |s| &mut s.i32,
            ),
        ]);
}

#[test]
fn qtailq_wire() {
    let mut obj = TestQtailq {
        i16: -512,
        q: vec![
            TestQtailqElement { b: true, u8: 130 },
            TestQtailqElement { b: false, u8: 65 },
        ],
        i32: 70000,
    };
    let wire = save_bytes(&VMSTATE_Q, &mut obj);
    assert_eq!(
        wire,
        [
            0xfe, 0x00, // i16
            0x01, 0x01, 0x82, // first element
            0x01, 0x00, 0x41, // second element
            0x00, // end of queue
            0x00, 0x01, 0x11, 0x70, // i32
        ]
    );

    let mut loaded = TestQtailq::default();
    load_bytes(&VMSTATE_Q, &mut loaded, &wire, 1).unwrap();
    assert_eq!(loaded, obj);
}

#[derive(Debug, Default, Clone, PartialEq)]
struct TestQListElement {
    id: u32,
}

#[derive(Debug, Default, Clone, PartialEq)]
struct TestQListContainer {
    id: u32,
    list: Vec<TestQListElement>,
}

lazy_static! {
    static ref VMSTATE_QLIST_ELEMENT: VMStateDescription<TestQListElement> =
        VMStateDescription::new("test/queue list", 1, 1).fields(vec![
            VMStateField::<TestQListElement>::single(
                "id",
                &VMSTATE_INFO_UINT32,
                |s| &mut s.id,
            ),
        ]);
    static ref VMSTATE_QLIST_CONTAINER: VMStateDescription<TestQListContainer> =
        VMStateDescription::new("test/container/qlist", 1, 1).fields(vec![
            VMStateField::<TestQListContainer>::single(
                "id",
                &VMSTATE_INFO_UINT32,
                |s| &mut s.id,
            ),
            VMStateField::<TestQListContainer>::qlist(
                "list",
                1,
                &VMSTATE_QLIST_ELEMENT,
                |s| &mut s.list,
            ),
        ]);
}

#[test]
fn qlist_preserves_order() {
    let mut obj = TestQListContainer {
        id: 1,
        list: [0x0a, 0x0b00, 0x0c_0000, 0x0d00_0000]
            .into_iter()
            .map(|id| TestQListElement { id })
            .collect(),
    };
    let wire = save_bytes(&VMSTATE_QLIST_CONTAINER, &mut obj);
    assert_eq!(
        wire,
        [
            0x00, 0x00, 0x00, 0x01, // container id
            0x01, 0x00, 0x00, 0x00, 0x0a, //
            0x01, 0x00, 0x00, 0x0b, 0x00, //
            0x01, 0x00, 0x0c, 0x00, 0x00, //
            0x01, 0x0d, 0x00, 0x00, 0x00, //
            0x00, // end of list
        ]
    );

    let mut loaded = TestQListContainer::default();
    load_bytes(&VMSTATE_QLIST_CONTAINER, &mut loaded, &wire, 1).unwrap();
    assert_eq!(loaded, obj);
}

// Ordered maps

#[derive(Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct TestGTreeInterval {
    low: u64,
    high: u64,
}

#[derive(Debug, Default, Clone, PartialEq)]
struct TestGTreeMapping {
    phys_addr: u64,
    flags: u32,
}

#[derive(Debug, Default, Clone, PartialEq)]
struct TestGTreeDomain {
    id: i32,
    mappings: BTreeMap<TestGTreeInterval, TestGTreeMapping>,
}

#[derive(Debug, Default, Clone, PartialEq)]
struct TestGTreeIommu {
    id: i32,
    domains: BTreeMap<u64, TestGTreeDomain>,
}

lazy_static! {
    static ref VMSTATE_INTERVAL: VMStateDescription<TestGTreeInterval> =
        VMStateDescription::new("interval", 1, 1).fields(vec![
            VMStateField::<TestGTreeInterval>::single(
                "low",
                &VMSTATE_INFO_UINT64,
                |s| &mut s.low,
            ),
            VMStateField::<TestGTreeInterval>::single(
                "high",
                &VMSTATE_INFO_UINT64,
                |s| &mut s.high,
            ),
        ]);
    static ref VMSTATE_MAPPING: VMStateDescription<TestGTreeMapping> =
        VMStateDescription::new("mapping", 1, 1).fields(vec![
            VMStateField::<TestGTreeMapping>::single(
                "phys_addr",
                &VMSTATE_INFO_UINT64,
                |s| &mut s.phys_addr,
            ),
            VMStateField::<TestGTreeMapping>::single(
                "flags",
                &VMSTATE_INFO_UINT32,
                |s| &mut s.flags,
            ),
        ]);
    static ref VMSTATE_DOMAIN: VMStateDescription<TestGTreeDomain> =
        VMStateDescription::new("domain", 1, 1).fields(vec![
            VMStateField::<TestGTreeDomain>::single(
                "id",
                &VMSTATE_INFO_INT32,
                |s| &mut s.id,
            ),
            VMStateField::<TestGTreeDomain>::gtree(
                "mappings",
                1,
                &VMSTATE_INTERVAL,
                &VMSTATE_MAPPING,
                |s| &mut s.mappings,
            ),
        ]);
    static ref VMSTATE_IOMMU: VMStateDescription<TestGTreeIommu> =
        VMStateDescription::new("iommu", 1, 1).fields(vec![
            VMStateField::<TestGTreeIommu>::single(
                "id",
                &VMSTATE_INFO_INT32,
                |s| &mut s.id,
            ),
            VMStateField::<TestGTreeIommu>::gtree_direct_key(
                "domains",
                1,
                &VMSTATE_DOMAIN,
                |s| &mut s.domains,
            ),
        ]);
}

fn mapping(low: u64, high: u64, phys_addr: u64, flags: u32) -> (TestGTreeInterval, TestGTreeMapping) {
    (TestGTreeInterval { low, high }, TestGTreeMapping { phys_addr, flags })
}

fn domain_6() -> TestGTreeDomain {
    TestGTreeDomain {
        id: 6,
        mappings: BTreeMap::from([
            mapping(0x1000, 0x1fff, 0xa000, 1),
            mapping(0x4000, 0x4fff, 0xe000, 2),
        ]),
    }
}

const FIRST_DOMAIN_DUMP: &[u8] = &[
    0x00, 0x00, 0x00, 0x06, // id
    0x00, 0x00, 0x00, 0x02, // number of nodes
    0x01, // start of a
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x1f, 0xff, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xa0, 0x00, //
    0x00, 0x00, 0x00, 0x01, //
    0x01, // start of b
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x40, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x4f, 0xff, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xe0, 0x00, //
    0x00, 0x00, 0x00, 0x02, //
    0x00, // end of tree
];

#[test]
fn gtree_domain_save_load() {
    let mut obj = domain_6();
    assert_eq!(save_bytes(&VMSTATE_DOMAIN, &mut obj), FIRST_DOMAIN_DUMP);

    let mut loaded = TestGTreeDomain::default();
    load_bytes(&VMSTATE_DOMAIN, &mut loaded, FIRST_DOMAIN_DUMP, 1).unwrap();
    assert_eq!(loaded, obj);
}

#[test]
fn gtree_node_count_mismatch() {
    let mut short = FIRST_DOMAIN_DUMP.to_vec();
    short[7] = 0x01;
    let mut loaded = TestGTreeDomain::default();
    let mut f = Stream::from_bytes(short);
    assert!(matches!(
        load_state(&mut f, &VMSTATE_DOMAIN, &mut loaded, 1),
        Err(VmStateError::CountMismatch { expected: 1, found: 2, .. })
    ));

    let mut long = FIRST_DOMAIN_DUMP.to_vec();
    long[7] = 0x03;
    long.push(EOF_MARKER);
    let mut loaded = TestGTreeDomain::default();
    let mut f = Stream::from_bytes(long);
    assert!(matches!(
        load_state(&mut f, &VMSTATE_DOMAIN, &mut loaded, 1),
        Err(VmStateError::CountMismatch { expected: 3, found: 2, .. })
    ));
}

#[test]
fn gtree_iommu_save_load() {
    let mut obj = TestGTreeIommu {
        id: 7,
        domains: BTreeMap::from([
            (
                5,
                TestGTreeDomain {
                    id: 5,
                    mappings: BTreeMap::from([mapping(0x0, 0xffffff, 0x0, 3)]),
                },
            ),
            (6, domain_6()),
        ]),
    };
    let mut expected = vec![
        0x00, 0x00, 0x00, 0x07, // id
        0x00, 0x00, 0x00, 0x02, // number of domains
        0x01, // start of domain 5
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x05, // key
        0x00, 0x00, 0x00, 0x05, // domain id
        0x00, 0x00, 0x00, 0x01, // one mapping
        0x01, // start of c
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
        0x00, 0x00, 0x00, 0x00, 0x00, 0xff, 0xff, 0xff, //
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
        0x00, 0x00, 0x00, 0x03, //
        0x00, // end of domain 5 mappings
        0x01, // start of domain 6
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x06, // key
    ];
    expected.extend_from_slice(FIRST_DOMAIN_DUMP);
    expected.push(0x00); // end of domains

    assert_eq!(save_bytes(&VMSTATE_IOMMU, &mut obj), expected);

    let mut loaded = TestGTreeIommu::default();
    load_bytes(&VMSTATE_IOMMU, &mut loaded, &expected, 1).unwrap();
    assert_eq!(loaded, obj);
}

// Temporaries

#[derive(Debug, Default, Clone, PartialEq)]
struct TmpTestStruct {
    parent: TestStruct,
    diff: i64,
}

lazy_static! {
    static ref VMSTATE_TMP_BACK_TO_PARENT: VMStateDescription<TestStruct> =
        VMStateDescription::new("test/tmp_child_parent", 0, 0).fields(vec![
            StructField::single("f", &VMSTATE_INFO_UINT64, |s| &mut s.f),
        ]);
    static ref VMSTATE_TMP_CHILD: VMStateDescription<TmpTestStruct> =
        VMStateDescription::new("test/tmp_child", 0, 0)
            .pre_save(|tmp: &mut TmpTestStruct| {
                tmp.diff = i64::from(tmp.parent.b) - i64::from(tmp.parent.a);
                Ok(())
            })
            .post_load(|tmp: &mut TmpTestStruct, _| {
                tmp.parent.b = u32::try_from(i64::from(tmp.parent.a) + tmp.diff)
                    .map_err(|e| VmStateError::Invalid(e.to_string()))?;
                Ok(())
            })
            .fields(vec![
                VMStateField::<TmpTestStruct>::single(
                    "diff",
                    &VMSTATE_INFO_INT64,
                    |s| &mut s.diff,
                ),
                VMStateField::<TmpTestStruct>::structure(
                    "parent",
                    &VMSTATE_TMP_BACK_TO_PARENT,
                    |s| &mut s.parent,
                ),
            ]);
    static ref VMSTATE_WITH_TMP: VMStateDescription<TestStruct> =
        VMStateDescription::new("test/with_tmp", 1, 1).fields(vec![
            StructField::single("a", &VMSTATE_INFO_UINT32, |s| &mut s.a),
            StructField::single("d", &VMSTATE_INFO_UINT64, |s| &mut s.d),
            StructField::with_tmp(
                &VMSTATE_TMP_CHILD,
                |s| TmpTestStruct { parent: s.clone(), diff: 0 },
                |s, tmp| {
                    s.b = tmp.parent.b;
                    s.f = tmp.parent.f;
                },
            ),
        ]);
}

#[test]
fn tmp_struct() {
    let mut obj = TestStruct { a: 2, b: 4, d: 1, f: 8, ..Default::default() };
    let wire = save_bytes(&VMSTATE_WITH_TMP, &mut obj);
    assert_eq!(
        wire,
        [
            0, 0, 0, 2, // a
            0, 0, 0, 0, 0, 0, 0, 1, // d
            0, 0, 0, 0, 0, 0, 0, 2, // diff
            0, 0, 0, 0, 0, 0, 0, 8, // f
        ]
    );

    let mut loaded = TestStruct::default();
    load_bytes(&VMSTATE_WITH_TMP, &mut loaded, &wire, 1).unwrap();
    assert_eq!((loaded.a, loaded.b, loaded.d, loaded.f), (2, 4, 1, 8));
}

lazy_static! {
    static ref VMSTATE_TMP_V2: VMStateDescription<TestStruct> =
        VMStateDescription::new("test/tmp_v2", 2, 2).fields(vec![
            StructField::single("c", &VMSTATE_INFO_UINT32, |s| &mut s.c),
            StructField::single("e", &VMSTATE_INFO_UINT32, |s| &mut s.e)
                .since(2),
        ]);
    static ref VMSTATE_WITH_TMP_V2: VMStateDescription<TestStruct> =
        VMStateDescription::new("test/with_tmp_v2", 1, 1).fields(vec![
            StructField::single("a", &VMSTATE_INFO_UINT32, |s| &mut s.a),
            StructField::with_tmp(
                &VMSTATE_TMP_V2,
                |s| s.clone(),
                |s, tmp| {
                    s.c = tmp.c;
                    s.e = tmp.e;
                },
            ),
        ]);
}

#[test]
fn tmp_struct_loads_at_own_version() {
    let mut obj = TestStruct { a: 1, c: 3, e: 5, ..Default::default() };
    let wire = save_bytes(&VMSTATE_WITH_TMP_V2, &mut obj);
    assert_eq!(wire, [0, 0, 0, 1, 0, 0, 0, 3, 0, 0, 0, 5]);

    let mut loaded = TestStruct::default();
    load_bytes(&VMSTATE_WITH_TMP_V2, &mut loaded, &wire, 1).unwrap();
    assert_eq!((loaded.a, loaded.c, loaded.e), (1, 3, 5));
}

// Subsections

#[derive(Debug, Default, Clone, PartialEq)]
struct TestDev {
    regs: u32,
    extra: u16,
    has_extra: bool,
    more: u8,
}

lazy_static! {
    static ref VMSTATE_DEV_EXTRA: VMStateDescription<TestDev> =
        VMStateDescription::new("dev/extra", 1, 1)
            .needed(|s: &TestDev| s.has_extra)
            .post_load(|s: &mut TestDev, _| {
                s.has_extra = true;
                Ok(())
            })
            .fields(vec![VMStateField::<TestDev>::single(
                "extra",
                &VMSTATE_INFO_UINT16,
                |s| &mut s.extra,
            )]);
    static ref VMSTATE_DEV_MORE: VMStateDescription<TestDev> =
        VMStateDescription::new("dev/more", 2, 1).fields(vec![
            VMStateField::<TestDev>::single(
                "more",
                &VMSTATE_INFO_UINT8,
                |s| &mut s.more,
            ),
        ]);
    static ref VMSTATE_DEV: VMStateDescription<TestDev> =
        VMStateDescription::new("dev", 1, 1)
            .fields(vec![VMStateField::<TestDev>::single(
                "regs",
                &VMSTATE_INFO_UINT32,
                |s| &mut s.regs,
            )])
            .subsections(vec![&*VMSTATE_DEV_EXTRA, &*VMSTATE_DEV_MORE]);
    // Same layout, but knows nothing of "dev/more".
    static ref VMSTATE_DEV_OLD: VMStateDescription<TestDev> =
        VMStateDescription::new("dev", 1, 1)
            .fields(vec![VMStateField::<TestDev>::single(
                "regs",
                &VMSTATE_INFO_UINT32,
                |s| &mut s.regs,
            )])
            .subsections(vec![&*VMSTATE_DEV_EXTRA]);
}

const WIRE_DEV_EXTRA_ONLY: &[u8] = &[
    0x00, 0x00, 0x00, 0x2a, // regs
    QEMU_VM_SUBSECTION,
    9, b'd', b'e', b'v', b'/', b'e', b'x', b't', b'r', b'a',
    0x00, 0x00, 0x00, 0x01, // version
    0x12, 0x34, // extra
];

#[test]
fn subsection_only_when_needed() {
    let mut obj = TestDev { regs: 42, extra: 0x1234, has_extra: false, more: 3 };
    let wire = save_bytes(&VMSTATE_DEV, &mut obj);
    // "dev/more" is always needed.
    assert_eq!(
        wire,
        [
            0x00, 0x00, 0x00, 0x2a, // regs
            QEMU_VM_SUBSECTION,
            8, b'd', b'e', b'v', b'/', b'm', b'o', b'r', b'e',
            0x00, 0x00, 0x00, 0x02, // version
            0x03, // more
        ]
    );

    obj.has_extra = true;
    let wire = save_bytes(&VMSTATE_DEV, &mut obj);
    assert_eq!(&wire[..WIRE_DEV_EXTRA_ONLY.len()], WIRE_DEV_EXTRA_ONLY);
}

#[test]
fn subsection_load_subset() {
    let mut loaded = TestDev::default();
    load_bytes(&VMSTATE_DEV, &mut loaded, WIRE_DEV_EXTRA_ONLY, 1).unwrap();
    assert_eq!(
        loaded,
        TestDev { regs: 42, extra: 0x1234, has_extra: true, more: 0 }
    );

    // Absent subsections leave their state untouched.
    let mut loaded = TestDev { extra: 7, ..Default::default() };
    load_bytes(&VMSTATE_DEV, &mut loaded, &WIRE_DEV_EXTRA_ONLY[..4], 1).unwrap();
    assert_eq!((loaded.regs, loaded.extra, loaded.has_extra), (42, 7, false));
}

#[test]
fn unknown_subsection_rejected() {
    let mut obj = TestDev { regs: 1, more: 9, ..Default::default() };
    let wire = save_bytes(&VMSTATE_DEV, &mut obj);

    let mut loaded = TestDev::default();
    let mut f = Stream::from_bytes(wire);
    match load_state(&mut f, &VMSTATE_DEV_OLD, &mut loaded, 1) {
        Err(VmStateError::UnknownSubsection { parent: "dev", name }) => {
            assert_eq!(name, "dev/more")
        }
        other => panic!("unexpected result {other:?}"),
    }
}

#[test]
fn foreign_subsection_left_for_caller() {
    // A subsection whose name lacks our prefix belongs to an outer record.
    let mut wire = vec![0x00, 0x00, 0x00, 0x05];
    wire.push(QEMU_VM_SUBSECTION);
    wire.push(5);
    wire.extend_from_slice(b"other");
    wire.extend_from_slice(&[0, 0, 0, 1]);

    let mut loaded = TestDev::default();
    let mut f = Stream::from_bytes(wire);
    load_state(&mut f, &VMSTATE_DEV, &mut loaded, 1).unwrap();
    assert_eq!(loaded.regs, 5);
    assert_eq!(f.get_byte(), QEMU_VM_SUBSECTION);
}

#[test]
fn subsection_version_checked() {
    let mut wire = WIRE_DEV_EXTRA_ONLY.to_vec();
    wire[18] = 0x02;
    let mut loaded = TestDev::default();
    let mut f = Stream::from_bytes(wire);
    assert!(matches!(
        load_state(&mut f, &VMSTATE_DEV, &mut loaded, 1),
        Err(VmStateError::VersionTooNew { name: "dev/extra", .. })
    ));
}

// Validation, buffers, bitmaps and the other special fields.

#[derive(Debug, Default, Clone, PartialEq)]
struct TestMisc {
    len: u32,
    data: Vec<u8>,
    fixed: [u8; 6],
    words: Vec<u32>,
    nwords: u8,
    bits: BitVec<u64, Lsb0>,
    ok: bool,
}

type MiscField = VMStateField<TestMisc>;

lazy_static! {
    static ref VMSTATE_MISC: VMStateDescription<TestMisc> =
        VMStateDescription::new("misc", 1, 1).fields(vec![
            MiscField::single("len", &VMSTATE_INFO_UINT32, |s| &mut s.len),
            MiscField::vbuffer_alloc(
                "data",
                Count::Sibling(|s| s.len as usize),
                |s| &mut s.data,
            ),
            MiscField::partial_buffer("fixed", 2, Count::Fixed(3), |s| &mut s.fixed[..]),
            MiscField::unused(3),
            MiscField::single("nwords", &VMSTATE_INFO_UINT8, |s| &mut s.nwords),
            MiscField::alloc_array(
                "words",
                &VMSTATE_INFO_UINT32,
                Count::Sibling(|s| usize::from(s.nwords)),
                |s| &mut s.words,
            ),
            MiscField::bitmap("bits", Count::Fixed(70), |s| &mut s.bits),
            MiscField::validate("ok", |s, _| s.ok),
        ]);
}

fn misc_obj() -> TestMisc {
    let mut bits = bitvec![u64, Lsb0; 0; 70];
    bits.set(0, true);
    bits.set(65, true);
    TestMisc {
        len: 2,
        data: vec![0xaa, 0xbb],
        fixed: [0, 0, 1, 2, 3, 0],
        words: vec![0x0102_0304],
        nwords: 1,
        bits,
        ok: true,
    }
}

#[test]
fn misc_fields_wire() {
    let mut obj = misc_obj();
    let wire = save_bytes(&VMSTATE_MISC, &mut obj);
    assert_eq!(
        wire,
        [
            0, 0, 0, 2, // len
            0xaa, 0xbb, // data
            1, 2, 3, // fixed[2..5]
            0, 0, 0, // unused
            1, // nwords
            1, 2, 3, 4, // words
            0, 0, 0, 0, 0, 0, 0, 1, // bits 0..64
            0, 0, 0, 0, 0, 0, 0, 2, // bits 64..70
        ]
    );

    let mut loaded = TestMisc { ok: true, ..Default::default() };
    load_bytes(&VMSTATE_MISC, &mut loaded, &wire, 1).unwrap();
    assert_eq!(loaded, obj);
}

#[test]
fn validation_failure() {
    let mut obj = misc_obj();
    obj.ok = false;
    let mut f = Stream::output(MemBuffer::new());
    assert!(matches!(
        save_state(&mut f, &VMSTATE_MISC, &mut obj, None),
        Err(VmStateError::Validation { vmsd: "misc", field: "ok" })
    ));

    let wire = save_bytes(&VMSTATE_MISC, &mut misc_obj());
    let mut loaded = TestMisc::default();
    let mut f = Stream::from_bytes(wire);
    assert!(matches!(
        load_state(&mut f, &VMSTATE_MISC, &mut loaded, 1),
        Err(VmStateError::Validation { vmsd: "misc", field: "ok" })
    ));
}

#[test]
fn unmigratable_refuses_save() {
    lazy_static! {
        static ref VMSTATE_NOPE: VMStateDescription<TestStructTriv> =
            VMStateDescription::new("nope", 1, 1).unmigratable();
    }
    let mut f = Stream::output(MemBuffer::new());
    assert!(matches!(
        save_state(&mut f, &VMSTATE_NOPE, &mut TestStructTriv::default(), None),
        Err(VmStateError::Unmigratable("nope"))
    ));
}

#[test]
fn description_of_saved_fields() {
    let mut obj = TestQtailq {
        i16: 1,
        q: vec![TestQtailqElement::default()],
        i32: 2,
    };
    let mut desc = VmsdDesc::default();
    let mut f = Stream::output(MemBuffer::new());
    save_state(&mut f, &VMSTATE_Q, &mut obj, Some(&mut desc)).unwrap();
    assert_eq!(desc.vmsd_name, "test/queue");
    assert_eq!(desc.version, 1);
    let fields: Vec<_> =
        desc.fields.iter().map(|d| (d.name.as_str(), d.ty, d.size)).collect();
    assert_eq!(
        fields,
        vec![("i16", "int16", 2), ("q", "qtailq", 4), ("i32", "int32", 4)]
    );

    let mut obj = TestArrayOfPtr {
        ptrs: [triv(0), None, None, triv(3)],
        ints: Default::default(),
    };
    let mut desc = VmsdDesc::default();
    save_state(&mut f, &VMSTATE_ARRAY_OF_PTR, &mut obj, Some(&mut desc)).unwrap();
    let ptrs: Vec<_> = desc
        .fields
        .iter()
        .filter(|d| d.name == "ptrs")
        .map(|d| (d.ty, d.index, d.array_len))
        .collect();
    assert_eq!(
        ptrs,
        vec![
            ("struct", Some(0), None),
            ("nullptr", Some(1), Some(2)),
            ("struct", Some(3), None),
        ]
    );
    assert_eq!(
        desc.fields[0].structure.as_ref().map(|s| s.vmsd_name.as_str()),
        Some("struct/triv")
    );
}

proptest! {
    #[test]
    fn simple_round_trip(
        b_1: bool,
        u8_1: u8,
        u16_1: u16,
        u32_1: u32,
        u64_1: u64,
        i8_2: i8,
        i16_2: i16,
        i32_2: i32,
        i64_2: i64,
    ) {
        let mut obj = TestSimple {
            b_1, u8_1, u16_1, u32_1, u64_1, i8_2, i16_2, i32_2, i64_2,
            ..Default::default()
        };
        let wire = save_bytes(&VMSTATE_SIMPLE_PRIMITIVE, &mut obj);
        prop_assert_eq!(wire.len(), WIRE_SIMPLE_PRIMITIVE.len());
        let mut loaded = TestSimple::default();
        load_bytes(&VMSTATE_SIMPLE_PRIMITIVE, &mut loaded, &wire, 1).unwrap();
        prop_assert_eq!(loaded, obj);
    }
}
