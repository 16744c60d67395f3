// Property tests: numeric expressions agree with direct evaluation

mod common;
use common::*;
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Expr {
    Num(u8),
    Neg(Box<Expr>),
    Bin(Box<Expr>, char, Box<Expr>),
}

impl Expr {
    /// Fully parenthesized source text
    fn source(&self) -> String {
        match self {
            Expr::Num(n) => n.to_string(),
            Expr::Neg(inner) => format!("-({})", inner.source()),
            Expr::Bin(a, op, b) => format!("({} {} {})", a.source(), op, b.source()),
        }
    }

    /// Zero divisors included: scripts follow IEEE 754 like Rust does
    fn eval(&self) -> f64 {
        match self {
            Expr::Num(n) => *n as f64,
            Expr::Neg(inner) => -inner.eval(),
            Expr::Bin(a, op, b) => {
                let (a, b) = (a.eval(), b.eval());
                match op {
                    '+' => a + b,
                    '-' => a - b,
                    '*' => a * b,
                    '/' => a / b,
                    _ => a % b,
                }
            }
        }
    }
}

fn expr_strategy() -> impl Strategy<Value = Expr> {
    let leaf = (0u8..20).prop_map(Expr::Num);
    leaf.prop_recursive(4, 24, 2, |inner| {
        prop_oneof![
            inner.clone().prop_map(|e| Expr::Neg(Box::new(e))),
            (
                inner.clone(),
                prop::sample::select(vec!['+', '-', '*', '/', '%']),
                inner
            )
                .prop_map(|(a, op, b)| Expr::Bin(Box::new(a), op, Box::new(b))),
        ]
    })
}

fn script_result(expr: &str) -> Result<f64, ErrorKind> {
    let mut vm = Vm::with_captured_output();
    vm.run_source(&format!("var result = {};", expr), "<prop>")
        .map_err(|e| e.kind)?;
    Ok(vm
        .get_global("result")
        .and_then(|v| v.as_number())
        .unwrap_or(f64::NAN))
}

proptest! {
    #[test]
    fn parenthesized_arithmetic_matches_rust(expr in expr_strategy()) {
        let source = expr.source();
        let expected = expr.eval();
        let actual = script_result(&source);
        prop_assert!(
            actual.is_ok_and(|v| v == expected || (v.is_nan() && expected.is_nan())),
            "{} = {:?}, expected {}",
            source,
            script_result(&source),
            expected
        );
    }

    #[test]
    fn precedence_and_left_associativity(a in 1u8..50, b in 1u8..50, c in 1u8..50) {
        let cases = [
            (format!("{} - {} - {}", a, b, c), (a as f64 - b as f64) - c as f64),
            (format!("{} + {} * {}", a, b, c), a as f64 + b as f64 * c as f64),
            (format!("{} / {} / {}", a, b, c), (a as f64 / b as f64) / c as f64),
            (format!("{} - {} % {}", a, b, c), a as f64 - b as f64 % c as f64),
            (format!("-{} * {}", a, b), -(a as f64) * b as f64),
        ];
        for (source, expected) in cases {
            prop_assert_eq!(script_result(&source), Ok(expected), "{}", source);
        }
    }
}
