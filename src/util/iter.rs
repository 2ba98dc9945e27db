/// Iterator adapters.
pub trait TakeThroughExt: Iterator + Sized {
    /// Like [`Iterator::take_while`], but negated, and yielding the item
    /// which stopped the iteration. Used to end token streams with their
    /// terminating [`TokenKind::Eof`](crate::token::TokenKind::Eof).
    fn take_through<P>(self, last: P) -> TakeThrough<Self, P>
    where
        P: FnMut(&Self::Item) -> bool,
    {
        TakeThrough {
            iter: self,
            last,
            done: false,
        }
    }
}

impl<I: Iterator> TakeThroughExt for I {}

pub struct TakeThrough<I, P> {
    iter: I,
    last: P,
    done: bool,
}

impl<I, P> Iterator for TakeThrough<I, P>
where
    I: Iterator,
    P: FnMut(&I::Item) -> bool,
{
    type Item = I::Item;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let item = self.iter.next()?;
        self.done = (self.last)(&item);
        Some(item)
    }
}
