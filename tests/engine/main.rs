
mod breakpoints;
mod control;
mod inspect;
mod session;
