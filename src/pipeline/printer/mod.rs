use super::graph::DependencyGraph;
use super::ramp::{Body, Instr, InstructionStream, PipelinedLoop, Step};
use super::sync::SyncPlan;

struct PrinterState {
    indent_size: usize,
    indent: usize,
    max_line_size: usize,
    buf: String,
}

impl PrinterState {
    fn new(indent_size: usize, max_line_size: usize) -> Self {
        PrinterState {
            indent_size,
            indent: 0,
            max_line_size,
            buf: String::new(),
        }
    }

    fn push_char(&mut self, c: char) {
        self.buf.push(c);
    }

    fn push_token(&mut self, s: impl AsRef<str>) {
        self.buf.push_str(s.as_ref());
    }

    fn newline(&mut self) {
        if !self.buf.is_empty() {
            self.push_char('\n');
        }
        for _ in 0..self.indent {
            self.push_char(' ');
        }
    }

    fn indent(&mut self) {
        self.indent += self.indent_size;
    }

    fn unindent(&mut self) {
        self.indent -= self.indent_size;
    }

    fn arg_list(&mut self, args: impl Iterator<Item = String>) {
        let max_line_size = self.max_line_size.saturating_sub(self.indent);
        let arg_list = args.collect::<Vec<String>>();

        let overflow = arg_list.iter().map(|x| x.len() + 2).sum::<usize>() > max_line_size;
        if overflow {
            self.indent();
            self.newline();
            for arg in arg_list.iter().take(arg_list.len().saturating_sub(1)) {
                self.push_token(arg);
                self.push_char(',');
                self.newline();
            }
            if let Some(s) = arg_list.last() {
                self.push_token(s);
            }
            self.unindent();
            self.newline();
        } else {
            self.push_token(arg_list.join(", "));
        }
    }

    fn call(&mut self, name: &str, args: Vec<String>) {
        self.newline();
        self.push_token(name);
        self.push_char('(');
        self.arg_list(args.into_iter());
        self.push_char(')');
    }

    fn open(&mut self, header: impl AsRef<str>) {
        self.newline();
        self.push_token(header);
        self.push_token(" {");
        self.indent();
    }

    fn close(&mut self) {
        self.unindent();
        self.newline();
        self.push_char('}');
    }

    fn get_string(self) -> String {
        self.buf
    }
}

fn instrs(state: &mut PrinterState, body: &Body, graph: &DependencyGraph) {
    for instr in body.instrs.iter() {
        match instr {
            Instr::Wait { class, producer_iter } => {
                state.call("wait", vec![class.to_string(), producer_iter.to_string()])
            }
            Instr::Exec { stage, iter } => state.call(graph.name(*stage), vec![iter.to_string()]),
            Instr::Arrive { class, producer_iter } => {
                state.call("arrive", vec![class.to_string(), producer_iter.to_string()])
            }
        }
    }
}

fn body(state: &mut PrinterState, body: &Body, graph: &DependencyGraph) {
    state.open(body.phase.to_string());
    instrs(state, body, graph);
    state.close();
}

/// Human readable form of a generated loop: barrier classes, then the code shapes keyed
/// by the trip counts that select them.
pub fn render(program: &PipelinedLoop, graph: &DependencyGraph, sync: &SyncPlan) -> String {
    let mut state = PrinterState::new(4, 100);
    state.newline();
    state.push_token(format!(
        "// {} stages, num_stages = {}, ramp = {}, {} barrier(s)",
        graph.stages().len(),
        graph.num_stages(),
        program.ramp_width(),
        sync.num_barriers()
    ));
    for c in sync.classes() {
        state.newline();
        state.push_token(format!(
            "barrier {} = {} -> {} (delta {}, ids {}..{}",
            c.id,
            graph.name(c.producer),
            graph.name(c.consumer),
            c.delta,
            c.ids().start,
            c.ids().end
        ));
        if c.sharers > 1 {
            state.push_token(format!(", turn {} of {}", c.rank, c.sharers));
        }
        state.push_char(')');
    }
    for c in sync.covered() {
        state.newline();
        state.push_token(format!(
            "// {} -> {} (delta {}) ordered by {}",
            graph.name(c.producer),
            graph.name(c.consumer),
            c.delta,
            c.by
        ));
    }

    state.open(format!("pipelined(T = {})", program.trip_count()));
    if let Some(main) = program.main() {
        state.open(format!("if T >= {}", program.min_main_trip()));
        for b in main.prologue.iter() {
            body(&mut state, b, graph);
        }
        state.open(format!("for k in 0..T - {}", program.ramp_width()));
        instrs(&mut state, &main.steady, graph);
        state.close();
        for b in main.epilogue.iter() {
            body(&mut state, b, graph);
        }
        state.close();
    }
    for (trip, bodies) in program.variants() {
        state.open(format!("if T == {}", trip));
        for b in bodies.iter() {
            body(&mut state, b, graph);
        }
        state.close();
    }
    for lane in program.fences() {
        state.call("fence", vec![lane.to_string()]);
    }
    state.close();
    state.get_string()
}

/// One line per step of a flattened loop.
pub fn render_stream(stream: &InstructionStream, graph: &DependencyGraph) -> String {
    let mut state = PrinterState::new(4, 100);
    for (phase, step) in stream.iter() {
        state.newline();
        let phase = phase.to_string();
        let line = match *step {
            Step::Wait { id, parity, class, producer_iter } => {
                format!("{:<10} wait b{} parity {}  ({} for iteration {})", phase, id, parity, class, producer_iter)
            }
            Step::Exec { stage, iteration } => format!("{:<10} {}[{}]", phase, graph.name(stage), iteration),
            Step::Arrive { id, class, producer_iter } => {
                format!("{:<10} arrive b{}  ({} for iteration {})", phase, id, class, producer_iter)
            }
            Step::Fence(lane) => format!("{:<10} fence {}", phase, lane),
        };
        state.push_token(line);
    }
    state.get_string()
}
