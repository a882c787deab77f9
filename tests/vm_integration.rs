//! End-to-end scenarios exercising the VM against hand-assembled bytecode, standing
//! in for a compiler front-end.

use embervm::{Instruction, OpCode, RunMode, Scope, Value, VirtualMachine, VmConfig};

fn encode(opcode: OpCode, arg: u32) -> u32 {
    Instruction::new(opcode, arg).encode()
}

fn run_program(program: Vec<u32>, constants: Vec<Value>, identifiers: Vec<&str>) -> VirtualMachine {
    let mut vm = VirtualMachine::new(VmConfig::default());
    vm.load(
        program,
        constants,
        identifiers.into_iter().map(str::to_string).collect(),
        Vec::new(),
    );
    vm.initialize(Scope::new_root());
    assert!(vm.run(RunMode::Normal), "{:?}", vm.error());
    vm
}

#[test]
fn arithmetic_scenario() {
    // x = 3 + 4 * 2;
    let program = vec![
        encode(OpCode::Psh, 0),
        encode(OpCode::Psh, 1),
        encode(OpCode::Psh, 2),
        encode(OpCode::Mul, 0),
        encode(OpCode::Add, 0),
        encode(OpCode::Nref, 0),
        encode(OpCode::Wr, 0),
        encode(OpCode::Pop, 0),
        encode(OpCode::End, 0),
    ];
    let constants = vec![Value::new_number(3.0), Value::new_number(4.0), Value::new_number(2.0)];
    let vm = run_program(program, constants, vec!["x"]);
    let x = vm.root_scope().unwrap().lookup("x", false).unwrap();
    assert_eq!(Value::deref_cell(&x).unwrap().borrow().as_number(), 11.0);
}

#[test]
fn string_concat_scenario() {
    // s = "a" + 2;
    let program = vec![
        encode(OpCode::Psh, 0),
        encode(OpCode::Psh, 1),
        encode(OpCode::Add, 0),
        encode(OpCode::Nref, 0),
        encode(OpCode::Wr, 0),
        encode(OpCode::Pop, 0),
        encode(OpCode::End, 0),
    ];
    let constants = vec![Value::new_string("a"), Value::new_number(2.0)];
    let vm = run_program(program, constants, vec!["s"]);
    let s = vm.root_scope().unwrap().lookup("s", false).unwrap();
    assert_eq!(Value::deref_cell(&s).unwrap().borrow().as_string(), "a2");
}

#[test]
fn vector_growth_via_idx_scenario() {
    // v[3] = 9; starting from a freshly created binding.
    let program = vec![
        encode(OpCode::Psh, 0),
        encode(OpCode::Nref, 0),
        encode(OpCode::Psh, 1),
        encode(OpCode::Idx, 1),
        encode(OpCode::Wr, 0),
        encode(OpCode::Pop, 0),
        encode(OpCode::End, 0),
    ];
    let constants = vec![Value::new_number(9.0), Value::new_number(3.0)];
    let vm = run_program(program, constants, vec!["v"]);
    let v = vm.root_scope().unwrap().lookup("v", false).unwrap();
    let v = Value::deref_cell(&v).unwrap();
    let borrowed = v.borrow();
    let items = borrowed.as_vector().unwrap();
    assert_eq!(items.len(), 4);
    assert_eq!(items[3].borrow().as_number(), 9.0);
    assert!(matches!(items[0].borrow().value_type(), embervm::ValueType::Null));
}

#[test]
fn table_literal_and_keys_scenario() {
    // h = {"a"=1, "b"=2}; k = @h;
    let program = vec![
        encode(OpCode::Psh, 0),
        encode(OpCode::Psh, 1),
        encode(OpCode::Psh, 2),
        encode(OpCode::Psh, 3),
        encode(OpCode::Hash, 2),
        encode(OpCode::Nref, 0),
        encode(OpCode::Wr, 0),
        encode(OpCode::Pop, 0),
        encode(OpCode::Rref, 0),
        encode(OpCode::Keys, 0),
        encode(OpCode::Nref, 1),
        encode(OpCode::Wr, 0),
        encode(OpCode::Pop, 0),
        encode(OpCode::End, 0),
    ];
    let constants = vec![
        Value::new_string("a"),
        Value::new_number(1.0),
        Value::new_string("b"),
        Value::new_number(2.0),
    ];
    let vm = run_program(program, constants, vec!["h", "k"]);
    let k = vm.root_scope().unwrap().lookup("k", false).unwrap();
    let k = Value::deref_cell(&k).unwrap();
    let borrowed = k.borrow();
    let items = borrowed.as_vector().unwrap();
    assert_eq!(items.len(), 2);
    let mut keys: Vec<String> = items.iter().map(|c| c.borrow().as_string()).collect();
    keys.sort();
    assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
}

#[test]
fn function_call_deep_copies_arguments_scenario() {
    // function f(a){ a[0]=99; return a; } v=[1,2]; r=f(v);
    const FADDR: u32 = 14;
    let program = vec![
        encode(OpCode::Psh, 0),   // 0: push 1.0
        encode(OpCode::Psh, 1),   // 1: push 2.0
        encode(OpCode::Vec, 2),   // 2: v = [1,2]
        encode(OpCode::Nref, 0),  // 3
        encode(OpCode::Wr, 0),    // 4
        encode(OpCode::Pop, 0),   // 5
        encode(OpCode::Nul, 0),   // 6: retval placeholder
        encode(OpCode::Rref, 0),  // 7: arg0 = v
        encode(OpCode::Fref, FADDR), // 8: callee
        encode(OpCode::Call, 1),  // 9
        encode(OpCode::Nref, 1),  // 10: r = ...
        encode(OpCode::Wr, 0),    // 11
        encode(OpCode::Pop, 0),   // 12
        encode(OpCode::End, 0),   // 13: halt before the function body
        // function body (address 14)
        encode(OpCode::Arg, 2),   // 14: bind a
        encode(OpCode::Psh, 2),   // 15: push 99.0
        encode(OpCode::Rref, 2),  // 16: ref to a
        encode(OpCode::Psh, 3),   // 17: push 0.0
        encode(OpCode::Idx, 1),   // 18: a[0] ref
        encode(OpCode::Wr, 0),    // 19: a[0] = 99
        encode(OpCode::Pop, 0),   // 20
        encode(OpCode::Rref, 2),  // 21: return a
        encode(OpCode::Ret, 0),   // 22
    ];
    let constants = vec![
        Value::new_number(1.0),
        Value::new_number(2.0),
        Value::new_number(99.0),
        Value::new_number(0.0),
    ];
    let vm = run_program(program, constants, vec!["v", "r", "a"]);

    let v = vm.root_scope().unwrap().lookup("v", false).unwrap();
    let v = Value::deref_cell(&v).unwrap();
    assert_eq!(v.borrow().as_vector().unwrap()[0].borrow().as_number(), 1.0);

    let r = vm.root_scope().unwrap().lookup("r", false).unwrap();
    let r = Value::deref_cell(&r).unwrap();
    assert_eq!(r.borrow().as_vector().unwrap()[0].borrow().as_number(), 99.0);
}

#[test]
fn method_call_binds_this_scenario() {
    // o = {"x"=10, "get"=<method>}; y = o->get();
    const METHOD_ADDR: u32 = 17;
    let program = {
        let mut p = vec![
            encode(OpCode::Psh, 0),            // 0: "x"
            encode(OpCode::Psh, 1),            // 1: 10.0
            encode(OpCode::Psh, 2),            // 2: "get"
            encode(OpCode::Fref, METHOD_ADDR), // 3: method value
            encode(OpCode::Hash, 2),           // 4
            encode(OpCode::Nref, 0),           // 5: o = {...}
            encode(OpCode::Wr, 0),             // 6
            encode(OpCode::Pop, 0),            // 7
            encode(OpCode::Rref, 0),           // 8: this = o
            encode(OpCode::Rref, 0),           // 9: base for member lookup
            encode(OpCode::Psh, 2),            // 10: "get"
            encode(OpCode::Key, 0),            // 11: ref to o.get
            encode(OpCode::Tcall, 0),          // 12
            encode(OpCode::Nref, 1),           // 13: y = ...
            encode(OpCode::Wr, 0),             // 14
            encode(OpCode::Pop, 0),            // 15
            encode(OpCode::End, 0),            // 16: halt before the method body
        ];
        assert_eq!(p.len() as u32, METHOD_ADDR);
        p.extend([
            encode(OpCode::Rref, 2), // ref to "this"
            encode(OpCode::Psh, 3),  // push "x"
            encode(OpCode::Key, 0),  // ref to this.x
            encode(OpCode::Ret, 0),
        ]);
        p
    };
    let constants = vec![
        Value::new_string("x"),
        Value::new_number(10.0),
        Value::new_string("get"),
        Value::new_string("x"),
    ];
    let vm = run_program(program, constants, vec!["o", "y", "this"]);

    let y = vm.root_scope().unwrap().lookup("y", false).unwrap();
    assert_eq!(Value::deref_cell(&y).unwrap().borrow().as_number(), 10.0);
    assert_eq!(vm.sp(), 0);
    assert_eq!(vm.frame_count(), 1);
}
