use japl::VirtualMachine;
use std::time::{Duration, Instant};

const RECURSION: &str = r#"
fun count(x) {
    if (x == 0) return 0;
    return 1 + count(x - 1);
}
count(300);
"#;

const FIBONACCI: &str = r#"
fun fib(n) {
    if (n < 2) return n;
    return fib(n - 1) + fib(n - 2);
}
fib(20);
"#;

const ARITHMETIC: &str = r#"
fun compute(n) {
    var a = 1; var b = 2; var c = 3; var d = 4; var e = 5;
    return (a + b) * (c + d) - e + n;
}
var total = 0;
for (var i = 0; i < 100; i = i + 1) {
    total = total + compute(i);
}
total;
"#;

const LOOPS: &str = r#"
var total = 0;
for (var i = 0; i < 100000; i = i + 1) {
    total = total + i;
}
total;
"#;

const STRINGS: &str = r#"
var line = "";
for (var i = 0; i < 200; i = i + 1) {
    line = line + "x";
}
line == "x" * 200;
"#;

fn run_benchmark(source: &str, iterations: u32) -> Option<Duration> {
    let mut total_time = Duration::ZERO;
    for _ in 0..iterations {
        let mut vm = VirtualMachine::new("<benchmark>");
        let start = Instant::now();
        if let Err(error) = vm.interpret(source) {
            eprintln!("  benchmark error: {}", error);
            return None;
        }
        total_time += start.elapsed();
    }
    Some(total_time)
}

const ITERATIONS: u32 = 100;

fn benchmark(name: &str, source: &str) {
    println!("{}:", name);
    if let Some(total) = run_benchmark(source, ITERATIONS) {
        let per_iteration = total.as_secs_f64() / f64::from(ITERATIONS) * 1000.0;
        println!("  {:.3}ms/iter ({} iterations)", per_iteration, ITERATIONS);
    }
    println!();
}

fn main() {
    println!("=== JAPL VM performance ===\n");
    benchmark("Recursion (300 calls)", RECURSION);
    benchmark("Fibonacci(20)", FIBONACCI);
    benchmark("Arithmetic (100 fn calls)", ARITHMETIC);
    benchmark("Counting loop (100k iterations)", LOOPS);
    benchmark("String concatenation (200 rounds)", STRINGS);
}
