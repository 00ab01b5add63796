use scalargrad::Tape;

fn main() {
  // one weighted sum squashed through tanh: o = tanh(x1*w1 + x2*w2 + b)
  let tape = Tape::new();
  let x1 = tape.var(2.0);
  let x2 = tape.var(0.0);
  let w1 = tape.var(-3.0);
  let w2 = tape.var(1.0);
  let b = tape.var(6.881_373_587_019_543);

  let n = x1 * w1 + x2 * w2 + b;
  let o = n.tanh();

  o.backward();

  println!("o      = {:.6}", o.value());
  println!("do/dx1 = {:.6}", x1.grad());
  println!("do/dw1 = {:.6}", w1.grad());
  println!("do/dx2 = {:.6}", x2.grad());
  println!("do/dw2 = {:.6}", w2.grad());
  println!("do/db  = {:.6}", b.grad());
}
