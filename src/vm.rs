use super::{
    chunk::Instruction,
    compiler,
    heap::{mark_ref, mark_root, GrayStack, Heap, ObjectRef, ObjectRoot, Root},
    natives,
    reporter::{Report, Reporter},
    value::{
        BoundMethod, Class, Closure, Function, Instance, InternedString, LoxString, Native,
        UpValue, Value,
    },
};
use std::{
    cell::RefCell,
    collections::HashMap,
    io::{self, Write},
    rc::Rc,
};

const FRAMES_MAX: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpretError {
    Compile,
    Runtime,
}

pub struct Frame {
    closure: ObjectRoot<Closure>,
    ip: usize,
    slots_start: usize,
}

impl Frame {
    fn new(closure: ObjectRoot<Closure>, slots_start: usize) -> Self {
        Frame {
            closure,
            ip: 0,
            slots_start,
        }
    }

    fn function(&self) -> ObjectRoot<Function> {
        self.closure.content.function.upgrade().unwrap()
    }
}

/// Everything the collector must treat as live while the VM (or the
/// compiler running on its behalf) owns the heap.
struct VmRoots<'v> {
    stack: &'v Vec<Value>,
    frames: &'v Vec<Frame>,
    globals: &'v HashMap<InternedString, Value>,
    open_up_values: &'v Vec<ObjectRef<RefCell<UpValue>>>,
    init_string: &'v ObjectRef<LoxString>,
}

impl Root for VmRoots<'_> {
    fn mark(&self, gray: &mut GrayStack) {
        for value in self.stack {
            value.trace(gray);
        }
        for frame in self.frames {
            mark_root(Rc::clone(&frame.closure), gray);
        }
        for (name, value) in self.globals {
            mark_root(Rc::clone(&name.0), gray);
            value.trace(gray);
        }
        for up_value in self.open_up_values {
            mark_ref(up_value, gray);
        }
        mark_ref(self.init_string, gray);
    }
}

pub struct Vm {
    //TODO preallocate the stack to its fixed capacity instead of growing it
    stack: Vec<Value>,
    frames: Vec<Frame>,
    globals: HashMap<InternedString, Value>,
    /// Open upvalues ordered by stack location, innermost last.
    open_up_values: Vec<ObjectRef<RefCell<UpValue>>>,
    heap: Heap,
    init_string: ObjectRef<LoxString>,
    out: Box<dyn Write>,
}

impl Vm {
    pub fn new() -> Self {
        Self::with_output(Box::new(io::stdout()))
    }

    pub fn with_output(out: Box<dyn Write>) -> Self {
        let mut heap = Heap::new();
        let init_string = heap.intern("init".to_string());
        let mut vm = Self {
            stack: Vec::new(),
            frames: Vec::new(),
            globals: HashMap::new(),
            open_up_values: Vec::new(),
            heap,
            init_string,
            out,
        };

        for (name, native) in natives::NATIVES.iter() {
            let name = InternedString::from_ref(&vm.heap.intern(name.to_string()));
            let native = vm.heap.alloc(Native { function: *native });
            vm.globals.insert(name, Value::Native(native));
        }

        vm
    }

    pub fn interpret(
        &mut self,
        source: &str,
        reporter: &mut dyn Reporter,
    ) -> Result<(), InterpretError> {
        let function = {
            let Self {
                heap,
                stack,
                frames,
                globals,
                open_up_values,
                init_string,
                ..
            } = self;
            let roots = VmRoots {
                stack,
                frames,
                globals,
                open_up_values,
                init_string,
            };
            compiler::compile(source, heap, reporter, &roots)
                .map_err(|_| InterpretError::Compile)?
        };

        let closure = self.heap.alloc(Closure {
            function: Rc::downgrade(&function),
            upvalues: Vec::new(),
        });
        self.stack.push(Value::Closure(closure.clone()));
        self.call_closure(closure.upgrade().unwrap(), 0)
            .expect("the script takes no arguments");

        self.run(reporter)
    }

    //>> Stack and frame plumbing

    fn pop(&mut self) -> Value {
        self.stack.pop().unwrap()
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance].clone()
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().unwrap();
        let function = frame.closure.content.function.upgrade().unwrap();
        let byte = function.content.chunk.byte(frame.ip);
        frame.ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let frame = self.frames.last_mut().unwrap();
        let function = frame.closure.content.function.upgrade().unwrap();
        let value = function.content.chunk.u16_at(frame.ip);
        frame.ip += 2;
        value
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_byte() as usize;
        let frame = self.frames.last().unwrap();
        frame.function().content.chunk.constant(index).clone()
    }

    fn read_string(&mut self) -> InternedString {
        match self.read_constant() {
            Value::String(string) => InternedString::from_ref(&string),
            _ => unreachable!(),
        }
    }

    //<<

    fn runtime_error(&mut self, msg: &str, reporter: &mut dyn Reporter) {
        let mut trace = Vec::new();
        for frame in self.frames.iter().rev() {
            let function = frame.function();
            let line = function.content.chunk.line_at(frame.ip.saturating_sub(1));
            match &function.content.name {
                Some(name) => trace.push(format!(
                    "[line {}] in {}()",
                    line,
                    name.upgrade().unwrap().content.chars
                )),
                None => trace.push(format!("[line {}] in script", line)),
            }
        }
        let line = trace_line(self.frames.last());

        reporter.error(Report::runtime(msg.to_string(), line, trace));

        self.stack.clear();
        self.frames.clear();
        self.open_up_values.clear();
    }

    fn collect_garbage(&mut self) {
        let Self {
            heap,
            stack,
            frames,
            globals,
            open_up_values,
            init_string,
            ..
        } = self;
        let roots = VmRoots {
            stack,
            frames,
            globals,
            open_up_values,
            init_string,
        };
        heap.collect(|gray| roots.mark(gray));
    }

    //>> Calls

    fn call_closure(&mut self, closure: ObjectRoot<Closure>, argc: usize) -> Result<(), String> {
        let function = closure.content.function.upgrade().unwrap();
        let arity = function.content.arity as usize;
        if argc != arity {
            return Err(format!("Expected {} arguments but got {}.", arity, argc));
        }
        if self.frames.len() == FRAMES_MAX {
            return Err("Stack overflow.".to_string());
        }
        let slots_start = self.stack.len() - argc - 1;
        self.frames.push(Frame::new(closure, slots_start));
        Ok(())
    }

    fn call_value(&mut self, argc: usize) -> Result<(), String> {
        let callee_index = self.stack.len() - argc - 1;
        match self.stack[callee_index].clone() {
            Value::Closure(closure) => self.call_closure(closure.upgrade().unwrap(), argc),
            Value::Native(native) => {
                let function = native.upgrade().unwrap().content.function;
                let result = function(&self.stack[self.stack.len() - argc..]);
                self.stack.truncate(callee_index);
                self.stack.push(result);
                Ok(())
            }
            Value::Class(class) => {
                let class = class.upgrade().unwrap();
                let instance = self.heap.alloc(Instance {
                    class: Rc::downgrade(&class),
                    fields: RefCell::new(HashMap::new()),
                });
                self.stack[callee_index] = Value::Instance(instance);

                let init = class
                    .content
                    .methods
                    .borrow()
                    .get(&InternedString::from_ref(&self.init_string))
                    .cloned();
                match init {
                    Some(Value::Closure(init)) => {
                        self.call_closure(init.upgrade().unwrap(), argc)
                    }
                    _ if argc != 0 => Err(format!("Expected 0 arguments but got {}.", argc)),
                    _ => Ok(()),
                }
            }
            Value::BoundMethod(bound) => {
                let bound = bound.upgrade().unwrap();
                self.stack[callee_index] = bound.content.receiver.clone();
                self.call_closure(bound.content.method.upgrade().unwrap(), argc)
            }
            _ => Err("Can only call functions and classes.".to_string()),
        }
    }

    fn invoke(&mut self, name: &InternedString, argc: usize) -> Result<(), String> {
        let instance = match self.peek(argc) {
            Value::Instance(obj) => obj.upgrade().unwrap(),
            _ => return Err("Only instances have methods.".to_string()),
        };

        // a field holding a callable shadows any method of the same name
        let field = instance.content.fields.borrow().get(name).cloned();
        if let Some(field) = field {
            let callee_index = self.stack.len() - argc - 1;
            self.stack[callee_index] = field;
            return self.call_value(argc);
        }

        let class = instance.content.class.upgrade().unwrap();
        self.invoke_from_class(&class, name, argc)
    }

    fn invoke_from_class(
        &mut self,
        class: &ObjectRoot<Class>,
        name: &InternedString,
        argc: usize,
    ) -> Result<(), String> {
        let method = class.content.methods.borrow().get(name).cloned();
        match method {
            Some(Value::Closure(closure)) => {
                self.call_closure(closure.upgrade().unwrap(), argc)
            }
            _ => Err(format!("Undefined property '{}'.", name.as_str())),
        }
    }

    //<<

    //>> Upvalues

    /// Returns the open upvalue for a stack slot, creating it in order
    /// if none exists; at most one open upvalue per slot.
    fn capture_up_value(&mut self, location: usize) -> ObjectRef<RefCell<UpValue>> {
        let mut insert_at = self.open_up_values.len();
        for (i, up_value) in self.open_up_values.iter().enumerate().rev() {
            let open = up_value.upgrade().unwrap().content.borrow().as_open();
            if open == location {
                return up_value.clone();
            }
            if open < location {
                break;
            }
            insert_at = i;
        }

        let up_value = self.heap.alloc(RefCell::new(UpValue::Open(location)));
        self.open_up_values.insert(insert_at, up_value.clone());
        up_value
    }

    /// Closes every open upvalue at or above `last`: the stack value
    /// moves into the upvalue cell and the cell leaves the open list.
    fn close_up_values(&mut self, last: usize) {
        loop {
            let up_value = match self.open_up_values.last() {
                Some(up_value) => up_value.upgrade().unwrap(),
                None => break,
            };
            let location = up_value.content.borrow().as_open();
            if location < last {
                break;
            }
            let value = self.stack[location].clone();
            up_value.content.borrow_mut().close(value);
            self.open_up_values.pop();
        }
    }

    //<<

    fn run(&mut self, reporter: &mut dyn Reporter) -> Result<(), InterpretError> {
        macro_rules! runtime_error {
            ($($arg:tt)*) => {{
                let msg = format!($($arg)*);
                self.runtime_error(&msg, reporter);
                return Err(InterpretError::Runtime)
            }};
        }

        // the type check happens before either operand pops, so both are
        // still on the stack for the error path
        macro_rules! binary_op {
            ($variant:ident, $op:tt) => {{
                if !self.peek(0).is_number() || !self.peek(1).is_number() {
                    runtime_error!("Operands must be numbers.");
                }
                let b = self.pop().as_number();
                let a = self.pop().as_number();
                self.stack.push(Value::$variant(a $op b));
            }};
        }

        loop {
            if self.heap.should_collect() {
                self.collect_garbage();
            }

            #[cfg(feature = "debug-execution")]
            {
                let mut line = String::from("          ");
                for value in &self.stack {
                    line += &format!("[ {} ]", value);
                }
                println!("{}", line);
                let frame = self.frames.last().unwrap();
                print!(
                    "{}",
                    frame
                        .function()
                        .content
                        .chunk
                        .disassemble_instr_at(frame.ip)
                        .0
                );
            }

            let instr = match Instruction::try_from(self.read_byte()) {
                Ok(instr) => instr,
                Err(()) => runtime_error!("Unknown opcode."),
            };

            match instr {
                Instruction::Constant => {
                    let value = self.read_constant();
                    self.stack.push(value);
                }
                Instruction::Nil => self.stack.push(Value::Nil),
                Instruction::True => self.stack.push(Value::Bool(true)),
                Instruction::False => self.stack.push(Value::Bool(false)),
                Instruction::Pop => {
                    self.pop();
                }
                Instruction::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frames.last().unwrap().slots_start;
                    self.stack.push(self.stack[base + slot].clone());
                }
                Instruction::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frames.last().unwrap().slots_start;
                    self.stack[base + slot] = self.peek(0);
                }
                Instruction::GetGlobal => {
                    let name = self.read_string();
                    match self.globals.get(&name).cloned() {
                        Some(value) => self.stack.push(value),
                        None => runtime_error!("Undefined variable '{}'.", name.as_str()),
                    }
                }
                Instruction::DefineGlobal => {
                    let name = self.read_string();
                    let value = self.peek(0);
                    self.globals.insert(name, value);
                    self.pop();
                }
                Instruction::SetGlobal => {
                    let name = self.read_string();
                    if self.globals.contains_key(&name) {
                        let value = self.peek(0);
                        self.globals.insert(name, value);
                    } else {
                        // assignment never creates a global
                        runtime_error!("Undefined variable '{}'.", name.as_str());
                    }
                }
                Instruction::GetUpValue => {
                    let index = self.read_byte() as usize;
                    let up_value = self.frames.last().unwrap().closure.content.upvalues[index]
                        .upgrade()
                        .unwrap();
                    let value = match &*up_value.content.borrow() {
                        UpValue::Open(location) => self.stack[*location].clone(),
                        UpValue::Closed(value) => value.clone(),
                    };
                    self.stack.push(value);
                }
                Instruction::SetUpValue => {
                    let index = self.read_byte() as usize;
                    let up_value = self.frames.last().unwrap().closure.content.upvalues[index]
                        .upgrade()
                        .unwrap();
                    let value = self.peek(0);
                    let location = {
                        let cell = up_value.content.borrow();
                        if cell.is_open() {
                            Some(cell.as_open())
                        } else {
                            None
                        }
                    };
                    match location {
                        Some(location) => self.stack[location] = value,
                        None => up_value.content.borrow_mut().close(value),
                    }
                }
                Instruction::GetProperty => {
                    let name = self.read_string();
                    let instance = match self.peek(0) {
                        Value::Instance(obj) => obj.upgrade().unwrap(),
                        _ => runtime_error!("Only instances have properties."),
                    };

                    let field = instance.content.fields.borrow().get(&name).cloned();
                    if let Some(value) = field {
                        self.pop();
                        self.stack.push(value);
                    } else {
                        let class = instance.content.class.upgrade().unwrap();
                        let method = class.content.methods.borrow().get(&name).cloned();
                        match method {
                            Some(Value::Closure(method)) => {
                                let receiver = self.peek(0);
                                let bound = self.heap.alloc(BoundMethod { receiver, method });
                                self.pop();
                                self.stack.push(Value::BoundMethod(bound));
                            }
                            _ => runtime_error!("Undefined property '{}'.", name.as_str()),
                        }
                    }
                }
                Instruction::SetProperty => {
                    let name = self.read_string();
                    let instance = match self.peek(1) {
                        Value::Instance(obj) => obj.upgrade().unwrap(),
                        _ => runtime_error!("Only instances have fields."),
                    };
                    let value = self.pop();
                    self.pop();
                    instance
                        .content
                        .fields
                        .borrow_mut()
                        .insert(name, value.clone());
                    self.stack.push(value);
                }
                Instruction::GetSuper => {
                    let name = self.read_string();
                    let superclass = match self.pop() {
                        Value::Class(class) => class.upgrade().unwrap(),
                        _ => unreachable!(),
                    };
                    let method = superclass.content.methods.borrow().get(&name).cloned();
                    match method {
                        Some(Value::Closure(method)) => {
                            let receiver = self.peek(0);
                            let bound = self.heap.alloc(BoundMethod { receiver, method });
                            self.pop();
                            self.stack.push(Value::BoundMethod(bound));
                        }
                        _ => runtime_error!("Undefined property '{}'.", name.as_str()),
                    }
                }
                Instruction::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.stack.push(Value::Bool(a == b));
                }
                Instruction::Greater => binary_op!(Bool, >),
                Instruction::Less => binary_op!(Bool, <),
                Instruction::Add => {
                    if self.peek(0).is_string() && self.peek(1).is_string() {
                        let b = self.pop().as_string();
                        let a = self.pop().as_string();
                        let chars = format!("{}{}", a.content.chars, b.content.chars);
                        let result = self.heap.intern(chars);
                        self.stack.push(Value::String(result));
                    } else if self.peek(0).is_number() && self.peek(1).is_number() {
                        let b = self.pop().as_number();
                        let a = self.pop().as_number();
                        self.stack.push(Value::Number(a + b));
                    } else {
                        runtime_error!("Operands must be two numbers or two strings.");
                    }
                }
                Instruction::Subtract => binary_op!(Number, -),
                Instruction::Multiply => binary_op!(Number, *),
                Instruction::Divide => binary_op!(Number, /),
                Instruction::Not => {
                    let value = self.pop();
                    self.stack.push(Value::Bool(!value.is_truthy()));
                }
                Instruction::Negate => {
                    if !self.peek(0).is_number() {
                        runtime_error!("Operand must be a number.");
                    }
                    let n = self.pop().as_number();
                    self.stack.push(Value::Number(-n));
                }
                Instruction::Print => {
                    let value = self.pop();
                    writeln!(self.out, "{}", value).ok();
                }
                Instruction::Jump => {
                    let offset = self.read_u16() as usize;
                    self.frames.last_mut().unwrap().ip += offset;
                }
                Instruction::JumpIfFalse => {
                    let offset = self.read_u16() as usize;
                    if !self.peek(0).is_truthy() {
                        self.frames.last_mut().unwrap().ip += offset;
                    }
                }
                Instruction::Loop => {
                    let offset = self.read_u16() as usize;
                    self.frames.last_mut().unwrap().ip -= offset;
                }
                Instruction::Call => {
                    let argc = self.read_byte() as usize;
                    if let Err(msg) = self.call_value(argc) {
                        runtime_error!("{}", msg);
                    }
                }
                Instruction::Invoke => {
                    let name = self.read_string();
                    let argc = self.read_byte() as usize;
                    if let Err(msg) = self.invoke(&name, argc) {
                        runtime_error!("{}", msg);
                    }
                }
                Instruction::SuperInvoke => {
                    let name = self.read_string();
                    let argc = self.read_byte() as usize;
                    let superclass = match self.pop() {
                        Value::Class(class) => class.upgrade().unwrap(),
                        _ => unreachable!(),
                    };
                    if let Err(msg) = self.invoke_from_class(&superclass, &name, argc) {
                        runtime_error!("{}", msg);
                    }
                }
                Instruction::Closure => {
                    let function = match self.read_constant() {
                        Value::Function(function) => function,
                        _ => unreachable!(),
                    };
                    let upvalue_count = function.upgrade().unwrap().content.upvalue_count;

                    let mut upvalues = Vec::with_capacity(upvalue_count);
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() != 0;
                        let index = self.read_byte() as usize;
                        if is_local {
                            let base = self.frames.last().unwrap().slots_start;
                            upvalues.push(self.capture_up_value(base + index));
                        } else {
                            let frame = self.frames.last().unwrap();
                            upvalues.push(frame.closure.content.upvalues[index].clone());
                        }
                    }

                    let closure = self.heap.alloc(Closure { function, upvalues });
                    self.stack.push(Value::Closure(closure));
                }
                Instruction::CloseUpValue => {
                    self.close_up_values(self.stack.len() - 1);
                    self.pop();
                }
                Instruction::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().unwrap();
                    self.close_up_values(frame.slots_start);

                    if self.frames.is_empty() {
                        self.pop();
                        return Ok(());
                    }
                    self.stack.truncate(frame.slots_start);
                    self.stack.push(result);
                }
                Instruction::Class => {
                    let name = self.read_string();
                    let class = self.heap.alloc(Class {
                        name: Rc::downgrade(&name.0),
                        methods: RefCell::new(HashMap::new()),
                    });
                    self.stack.push(Value::Class(class));
                }
                Instruction::Inherit => {
                    let superclass = match self.peek(1) {
                        Value::Class(class) => class.upgrade().unwrap(),
                        _ => runtime_error!("Superclass must be a class."),
                    };
                    let subclass = match self.peek(0) {
                        Value::Class(class) => class.upgrade().unwrap(),
                        _ => unreachable!(),
                    };
                    {
                        let methods = superclass.content.methods.borrow();
                        let mut sub_methods = subclass.content.methods.borrow_mut();
                        for (name, method) in methods.iter() {
                            sub_methods.insert(name.clone(), method.clone());
                        }
                    }
                    self.pop();
                }
                Instruction::Method => {
                    let name = self.read_string();
                    let method = self.peek(0);
                    let class = match self.peek(1) {
                        Value::Class(class) => class.upgrade().unwrap(),
                        _ => unreachable!(),
                    };
                    class.content.methods.borrow_mut().insert(name, method);
                    self.pop();
                }
            }
        }
    }
}

fn trace_line(frame: Option<&Frame>) -> u32 {
    match frame {
        Some(frame) => frame
            .function()
            .content
            .chunk
            .line_at(frame.ip.saturating_sub(1)),
        None => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ErrorsTracker {
        errors: Vec<Report>,
    }

    impl ErrorsTracker {
        fn new() -> Self {
            ErrorsTracker { errors: Vec::new() }
        }
    }

    impl Reporter for ErrorsTracker {
        fn warning(&mut self, _report: Report) {}

        fn error(&mut self, report: Report) {
            self.errors.push(report);
        }
    }

    #[derive(Clone)]
    struct SharedBuf(Rc<RefCell<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn run_source(source: &str) -> (Result<(), InterpretError>, String, Vec<Report>) {
        let buf = SharedBuf(Rc::new(RefCell::new(Vec::new())));
        let mut vm = Vm::with_output(Box::new(buf.clone()));
        let mut tracker = ErrorsTracker::new();
        let result = vm.interpret(source, &mut tracker);
        assert!(vm.stack.is_empty(), "stack must drain after a run");
        let output = String::from_utf8(buf.0.borrow().clone()).unwrap();
        (result, output, tracker.errors)
    }

    fn expect_output(source: &str, expected: &str) {
        let (result, output, errors) = run_source(source);
        for report in &errors {
            eprintln!("{}", report);
        }
        assert_eq!(result, Ok(()));
        assert_eq!(output, expected);
    }

    fn expect_runtime_error(source: &str, msg: &str) -> Vec<Report> {
        let (result, _, errors) = run_source(source);
        assert_eq!(result, Err(InterpretError::Runtime));
        assert_eq!(errors[0].msg, msg);
        errors
    }

    #[test]
    fn arithmetic_precedence() {
        expect_output("print 1 + 2 * 3;", "7\n");
        expect_output("print (1 + 2) * 3;", "9\n");
        expect_output("print -2 + 1;", "-1\n");
    }

    #[test]
    fn comparison_and_equality() {
        expect_output("print 1 < 2;", "true\n");
        expect_output("print 2 <= 1;", "false\n");
        expect_output("print \"a\" == \"a\";", "true\n");
        expect_output("print \"a\" == \"b\";", "false\n");
        expect_output("print nil == false;", "false\n");
        expect_output("print 1 != 2;", "true\n");
    }

    #[test]
    fn string_concatenation() {
        expect_output("print \"foo\" + \"bar\";", "foobar\n");
    }

    #[test]
    fn division_by_zero_is_ieee() {
        expect_output("print 1 / 0;", "inf\n");
        expect_output("print -1 / 0;", "-inf\n");
    }

    #[test]
    fn truthiness_and_short_circuit() {
        expect_output("print nil or \"x\"; print false and \"y\";", "x\nfalse\n");
        expect_output("print 0 and 1;", "1\n");
    }

    #[test]
    fn control_flow() {
        expect_output("if (1 > 2) print \"a\"; else print \"b\";", "b\n");
        expect_output("var i = 0; while (i < 3) { print i; i = i + 1; }", "0\n1\n2\n");
        expect_output("for (var i = 0; i < 3; i = i + 1) print i;", "0\n1\n2\n");
    }

    #[test]
    fn globals_shared_across_lines() {
        let buf = SharedBuf(Rc::new(RefCell::new(Vec::new())));
        let mut vm = Vm::with_output(Box::new(buf.clone()));
        let mut tracker = ErrorsTracker::new();
        vm.interpret("var a = 1;", &mut tracker).unwrap();
        vm.interpret("print a;", &mut tracker).unwrap();
        assert_eq!(String::from_utf8(buf.0.borrow().clone()).unwrap(), "1\n");
    }

    #[test]
    fn functions_and_returns() {
        expect_output("fun add(a, b) { return a + b; } print add(1, 2);", "3\n");
        expect_output("fun f() {} print f();", "nil\n");
        expect_output("fun f() { return; } print f();", "nil\n");
        expect_output("fun f() {} print f;", "<fn f>\n");
        expect_output("print clock() >= 0;", "true\n");
    }

    #[test]
    fn closures_capture_by_reference() {
        expect_output(
            "fun makeCounter() {\
               var i = 0;\
               fun count() { i = i + 1; print i; }\
               return count;\
             }\
             var c = makeCounter(); c(); c(); c();",
            "1\n2\n3\n",
        );
    }

    #[test]
    fn closures_share_captured_variable() {
        expect_output(
            "var a; var b;\
             { var x = \"shared\";\
               fun setA(v){ x = v; } fun getB(){ print x; }\
               a = setA; b = getB; }\
             a(\"hi\"); b();",
            "hi\n",
        );
    }

    #[test]
    fn loop_variable_closes_at_scope_exit() {
        expect_output(
            "var f;\
             for (var i = 0; i < 1; i = i + 1) { fun g() { print i; } f = g; }\
             f();",
            "1\n",
        );
    }

    #[test]
    fn classes_fields_and_methods() {
        expect_output(
            "class C {} var c = C(); c.x = 3; print c.x;",
            "3\n",
        );
        expect_output(
            "class C { m() { return \"m\"; } } print C().m();",
            "m\n",
        );
        expect_output("class C {} print C; print C();", "C\nC instance\n");
        expect_output(
            "class C { m() { return this; } } print C().m();",
            "C instance\n",
        );
    }

    #[test]
    fn bound_methods_keep_their_receiver() {
        expect_output(
            "class C { init(x) { this.x = x; } get() { print this.x; } }\
             var m = C(9).get; m();",
            "9\n",
        );
    }

    #[test]
    fn inheritance_and_super() {
        expect_output(
            "class A { greet() { print \"A\"; } }\
             class B < A { greet() { super.greet(); print \"B\"; } }\
             B().greet();",
            "A\nB\n",
        );
    }

    #[test]
    fn initializer_returns_this() {
        expect_output(
            "class C { init(x){ this.x = x; } } print C(5).x;",
            "5\n",
        );
        expect_output(
            "class C { init(){ this.x = 1; return; } } print C().x;",
            "1\n",
        );
    }

    #[test]
    fn field_shadows_method_on_invoke() {
        expect_output(
            "class C { m() { print \"method\"; } }\
             var c = C();\
             fun f() { print \"field\"; }\
             c.m = f;\
             c.m();",
            "field\n",
        );
    }

    #[test]
    fn add_type_error() {
        expect_runtime_error("print \"a\" + 1;", "Operands must be two numbers or two strings.");
    }

    #[test]
    fn numeric_operator_type_errors() {
        expect_runtime_error("print 1 - \"a\";", "Operands must be numbers.");
        expect_runtime_error("print -\"a\";", "Operand must be a number.");
    }

    #[test]
    fn wrong_argument_count() {
        expect_runtime_error("fun f(){} f(1);", "Expected 0 arguments but got 1.");
        expect_runtime_error(
            "class C { init(x) {} } C();",
            "Expected 1 arguments but got 0.",
        );
        expect_runtime_error("class C {} C(1);", "Expected 0 arguments but got 1.");
    }

    #[test]
    fn stack_overflow_on_unbounded_recursion() {
        expect_runtime_error("fun f() { f(); } f();", "Stack overflow.");
    }

    #[test]
    fn undefined_globals() {
        expect_runtime_error("print x;", "Undefined variable 'x'.");
        // assignment never creates the global
        expect_runtime_error("x = 1;", "Undefined variable 'x'.");
    }

    #[test]
    fn calling_a_non_callable() {
        expect_runtime_error("var x = 1; x();", "Can only call functions and classes.");
    }

    #[test]
    fn property_errors() {
        expect_runtime_error("var x = 1; print x.y;", "Only instances have properties.");
        expect_runtime_error("var x = 1; x.y = 2;", "Only instances have fields.");
        expect_runtime_error("class A {} print A().b;", "Undefined property 'b'.");
        expect_runtime_error("var x = 1; x.m();", "Only instances have methods.");
    }

    #[test]
    fn inheriting_from_a_non_class() {
        expect_runtime_error("var NotAClass = 1; class A < NotAClass {}", "Superclass must be a class.");
    }

    #[test]
    fn stack_trace_lists_frames_deepest_first() {
        let errors = expect_runtime_error(
            "fun b() { missing(); }\nfun a() { b(); }\na();",
            "Undefined variable 'missing'.",
        );
        let trace = &errors[0].trace;
        assert_eq!(trace.len(), 3);
        assert_eq!(trace[0], "[line 1] in b()");
        assert_eq!(trace[1], "[line 2] in a()");
        assert_eq!(trace[2], "[line 3] in script");
    }

    #[test]
    fn garbage_is_collected_between_runs() {
        let buf = SharedBuf(Rc::new(RefCell::new(Vec::new())));
        let mut vm = Vm::with_output(Box::new(buf.clone()));
        let mut tracker = ErrorsTracker::new();
        vm.interpret(
            "var g = \"keep\" + \"me\"; { var t = \"temp\" + \"orary\"; }",
            &mut tracker,
        )
        .unwrap();

        let before = vm.heap.object_count();
        vm.collect_garbage();
        let after = vm.heap.object_count();
        assert!(after < before);

        // everything reachable from the globals survived
        vm.interpret("print g;", &mut tracker).unwrap();
        assert_eq!(String::from_utf8(buf.0.borrow().clone()).unwrap(), "keepme\n");
    }

    #[test]
    fn open_upvalues_stay_ordered() {
        // two captures in one frame force ordered inserts
        expect_output(
            "fun outer(a, b) {\
               fun f() { print a + b; }\
               f();\
             }\
             outer(\"x\", \"y\");",
            "xy\n",
        );
    }
}
