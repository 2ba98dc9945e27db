use criterion::{criterion_group, criterion_main, Criterion};
use declscan::{
    lexer::{self, SUGGESTED_TOKENS_CAPACITY},
    token::{Token, TokenKind},
    util::TakeThroughExt,
};
use std::hint::black_box;

static INPUT: &str = include_str!("../../tests/fixtures/graphics.h");

fn lexer(input: &str) {
    let mut i = 0;
    for token in lexer::Lexer::new("graphics.h", input).take_through(Token::is_eof) {
        if matches!(token.kind, TokenKind::Error(_) | TokenKind::Eof) {
            continue;
        }
        i += 1;
    }
    black_box(i);
}

fn criterion_benchmark(c: &mut Criterion) {
    c.bench_function("lexer", |b| {
        b.iter(|| {
            black_box(lexer(black_box(INPUT)));
        })
    });

    let mut tokens = Vec::with_capacity(SUGGESTED_TOKENS_CAPACITY);
    c.bench_function("lexer (buffered)", |b| {
        b.iter(|| {
            tokens.clear();
            lexer::lex("graphics.h", black_box(INPUT), &mut tokens);
            black_box(tokens.len());
        })
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
